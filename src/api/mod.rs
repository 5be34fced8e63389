//! API module
//!
//! Contains HTTP request handlers for plan intake and service health.

pub mod handlers;
pub mod plans;
