//! Centralized error type for worldhost.
//!
//! Uses `thiserror` for ergonomic error definitions and maps every variant to an
//! HTTP status so the control API can return it directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Caller-facing error for every session lifecycle operation.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    // === Lookup errors ===
    #[error("{resource} not found")]
    NotFound { resource: String },

    // === Validation errors ===
    #[error("Validation failed: {message}")]
    Validation { message: String },

    // === Lifecycle errors ===
    #[error("Failed to start world: {message}")]
    StartFailed { message: String },

    /// Two live sessions reported the same id. This is an engine/registry
    /// contract breach, never a user mistake.
    #[error("Duplicate session id {0}")]
    DuplicateSession(String),

    #[error("World is already saving")]
    AlreadySaving,

    #[error("Failed to save world: {message}")]
    SaveFailed { message: String },

    #[error("Host is shutting down")]
    ShuttingDown,

    #[error("Operation cancelled")]
    Cancelled,

    // === Infrastructure errors ===
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body sent to clients.
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl HostError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::AlreadySaving => StatusCode::CONFLICT,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::StartFailed { .. }
            | Self::DuplicateSession(_)
            | Self::SaveFailed { .. }
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::StartFailed { .. } => "START_FAILED",
            Self::DuplicateSession(_) => "DUPLICATE_SESSION",
            Self::AlreadySaving => "ALREADY_SAVING",
            Self::SaveFailed { .. } => "SAVE_FAILED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Cancelled => "CANCELLED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to clients
        let message = match &self {
            HostError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            HostError::DuplicateSession(id) => {
                tracing::error!(session = %id, "Duplicate session id reported by engine");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.error_code().to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using HostError.
pub type HostResult<T> = Result<T, HostError>;
