//! Error types and error handling for the application
//!
//! This module defines custom error types that can be converted to HTTP responses.
//! All errors implement `IntoResponse` to provide consistent error formatting.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level error types
///
/// All errors that can occur in the application are represented by this enum.
/// Each variant implements automatic conversion to HTTP responses via `IntoResponse`.
///
/// Step-local failures (agent errors, grounding rejections, store errors) are
/// recorded in the owning `StepResult` and never surface here; only
/// plan-global conditions do.
#[derive(Error, Debug)]
pub enum AppError {
    /// Plan failed structural validation (cycle, unknown dependency, etc.)
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Plan execution failed as a whole (e.g. plan-level timeout)
    #[error("Plan execution failed: {0}")]
    PlanExecutionFailed(String),

    /// Schema snapshot could not be fetched for this run
    #[error("Schema unavailable: {0}")]
    SchemaUnavailable(#[from] crate::schema::SchemaError),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Internal server error (catch-all for unexpected errors)
    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InvalidPlan(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::PlanExecutionFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::SchemaUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::Timeout(_) => (StatusCode::REQUEST_TIMEOUT, self.to_string()),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
