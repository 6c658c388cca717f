//! Error types for Tempo Sync

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Result type for the sync core (codec, transport, ledger, resolver)
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Server application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sync protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Malformed binary envelope
    #[error("Decode error: {0}")]
    Decode(String),

    /// Data type unknown to the codec or the protocol
    #[error("Unsupported data type: {0}")]
    UnsupportedType(String),

    /// Textual (JSON) fallback failed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Merge strategy cannot produce a safe result
    #[error("Merge error: {0}")]
    Merge(String),

    /// Network failure talking to the remote store
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote store answered with a non-retryable error status
    #[error("Server rejected request with status {0}: {1}")]
    Rejected(u16, String),

    /// The remote store did not answer in time
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Local version observed ahead of the server
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Manual resolution applied without user confirmation
    #[error("Manual resolution for {0} was not confirmed by the user")]
    UnconfirmedResolution(String),

    /// Local data changed after the conflict was reported
    #[error("Conflict for {0} is stale: local data changed since it was reported")]
    StaleConflict(String),

    /// Manual resolution requested without user-supplied data
    #[error("Manual resolution for {0} requires user input")]
    MissingInput(String),
}

impl SyncError {
    /// Whether the error is transient and the request may be retried as-is
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Timeout(_))
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Sync(e) => match e {
                SyncError::Decode(_) | SyncError::Parse(_) => {
                    (StatusCode::BAD_REQUEST, "parse_error", e.to_string())
                }
                SyncError::UnsupportedType(_) => {
                    (StatusCode::BAD_REQUEST, "unsupported_type", e.to_string())
                }
                SyncError::Merge(_) => (StatusCode::CONFLICT, "merge_error", e.to_string()),
                _ => {
                    tracing::error!("Sync error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "sync_error",
                        "Sync error".to_string(),
                    )
                }
            },
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "Database error".to_string(),
                )
            }
            AppError::Json(e) => (
                StatusCode::BAD_REQUEST,
                "parse_error",
                format!("Invalid JSON: {}", e),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}
