//! Analytic store boundary
//!
//! The orchestrator consumes the relational analytic store, it never builds
//! one. This boundary accepts only [`ValidatedQuery`] values plus a row
//! limit, so raw agent text cannot cross it, and returns rows or a
//! classified execution error.

pub mod sqlite;

pub use sqlite::SqliteAnalyticStore;

use crate::grounding::ValidatedQuery;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Classified analytic store failure
#[derive(Error, Debug)]
pub enum StoreError {
    /// The query or connection acquisition timed out
    #[error("analytic store timeout: {0}")]
    Timeout(String),
    /// The store is unreachable
    #[error("analytic store connection failure: {0}")]
    Connection(String),
    /// The query failed to execute
    #[error("query execution failure: {0}")]
    Execution(String),
}

impl StoreError {
    /// True for failures worth one retry
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Connection(_))
    }
}

/// Rows returned by one validated query execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    /// Column names in result order
    pub columns: Vec<String>,
    /// One JSON object per row
    pub rows: Vec<Value>,
    /// Number of rows returned (after the row limit was applied)
    pub row_count: usize,
}

/// The analytic store boundary
#[async_trait]
pub trait AnalyticStore: Send + Sync {
    /// Execute a validated, read-only query
    ///
    /// `row_limit` is a hard cap applied regardless of any LIMIT clause the
    /// validator left in place.
    async fn execute(
        &self,
        query: &ValidatedQuery,
        row_limit: u64,
    ) -> Result<QueryOutput, StoreError>;
}
