//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **`RelayError`**: the typed failure taxonomy of the relay core (frame
//!   codec, dispatch, backend bridge, synthesis). Components return these and
//!   never stringify them themselves.
//! - **`AppError`**: the HTTP boundary type. Handlers return it and actix turns
//!   it into a JSON response.
//!
//! ## Where errors become strings:
//! Only at the outermost boundary. A `RelayError` raised inside a pipeline job
//! becomes a single `error` event on the client socket; one raised inside an
//! HTTP handler becomes an `AppError` response.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Which half of a backend exchange was running when a failure happened.
///
/// Submit and stream/poll have independent timeouts, so the phase is part of
/// every backend timeout report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPhase {
    Submit,
    Stream,
}

impl fmt::Display for BackendPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPhase::Submit => write!(f, "submit"),
            BackendPhase::Stream => write!(f, "stream"),
        }
    }
}

/// Failure taxonomy for the relay core.
///
/// ## Recovery rules:
/// - **Protocol**: the frame is dropped and logged, the session continues
/// - **PolicyViolation**: never surfaced, the audio simply keeps buffering
/// - **Backend / BackendTimeout / NotConfigured**: surfaced to the client as one
///   terminal `error` event, the session stays connected, nothing is retried
/// - **SynthesisTimeout**: local degradation only, the job still completes
/// - **Stage**: a recognition or response stage failed inside the local pipeline
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("malformed audio frame: expected {expected} bytes, got {actual}")]
    Protocol { expected: usize, actual: usize },

    #[error("dispatch already in flight for session {session_id}")]
    PolicyViolation { session_id: String },

    #[error("backend request failed: {message}")]
    Backend { message: String },

    #[error("backend {phase} timed out after {elapsed_ms}ms")]
    BackendTimeout { phase: BackendPhase, elapsed_ms: u64 },

    #[error("backend endpoint is not configured")]
    NotConfigured,

    #[error("synthesis deadline of {deadline_ms}ms reached")]
    SynthesisTimeout { deadline_ms: u64 },

    #[error("{stage} stage failed: {message}")]
    Stage { stage: &'static str, message: String },

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("maximum concurrent sessions ({0}) reached")]
    SessionLimit(usize),
}

impl RelayError {
    pub fn backend(message: impl Into<String>) -> Self {
        RelayError::Backend { message: message.into() }
    }

    pub fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        RelayError::Stage { stage, message: message.into() }
    }

    /// Whether this failure should mark a pipeline job as timed out rather than failed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::BackendTimeout { .. })
    }
}

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: The relay refused work it cannot take on right now (503 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Capacity limits reached (e.g. too many live sessions)
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "session client_42 not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            RelayError::SessionLimit(_) => AppError::Unavailable(err.to_string()),
            RelayError::Protocol { .. } => AppError::BadRequest(err.to_string()),
            RelayError::NotConfigured => AppError::ConfigError(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

/// Shorthand for relay core results.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_error_messages() {
        let err = RelayError::Protocol { expected: 4104, actual: 12 };
        assert_eq!(err.to_string(), "malformed audio frame: expected 4104 bytes, got 12");

        let err = RelayError::BackendTimeout { phase: BackendPhase::Stream, elapsed_ms: 1500 };
        assert_eq!(err.to_string(), "backend stream timed out after 1500ms");
        assert!(err.is_timeout());
        assert!(!RelayError::backend("boom").is_timeout());
    }

    #[test]
    fn test_relay_error_to_http_status() {
        let not_found: AppError = RelayError::SessionNotFound("client_1".to_string()).into();
        assert_eq!(
            not_found.error_response().status(),
            actix_web::http::StatusCode::NOT_FOUND
        );

        let limit: AppError = RelayError::SessionLimit(3).into();
        assert_eq!(
            limit.error_response().status(),
            actix_web::http::StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
