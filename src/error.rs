//! # HTTP Error Handling
//!
//! [`AppError`] is the error type of every HTTP handler. Implementing
//! actix-web's `ResponseError` lets handlers return `Result<_, AppError>`
//! and have failures rendered as a consistent JSON body.
//!
//! ## Where the other errors live:
//! Domain failures have their own enums next to the code that produces them
//! and never reach an HTTP client directly:
//! - `protocol::ProtocolError`: an inbound message could not be understood
//! - `media::MediaError`: a recorder failed to write or finalize
//! - `codec::CodecError`: the external encoder/decoder failed
//! - `session::SessionError`: a session operation was refused
//!
//! Those are logged where they happen. The only one that turns into an HTTP
//! response is the session limit, mapped to [`AppError::ServiceUnavailable`]
//! during the WebSocket upgrade.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
///
/// ## Status mapping:
/// - **Internal / ConfigError**: 500
/// - **BadRequest / ValidationError**: 400
/// - **NotFound**: 404
/// - **ServiceUnavailable**: 503
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "Maximum concurrent sessions (64) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Unexpected server-side failure
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// A config update failed validation
    ValidationError(String),

    /// Server is at capacity
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

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

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {}", err))
    }
}

/// Result alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_error_body_shape() {
        let err = AppError::ServiceUnavailable("full".to_string());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "service_unavailable");
        assert_eq!(value["error"]["message"], "full");
        assert!(value["error"]["timestamp"].is_string());
    }

    #[test]
    fn test_conversions() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, AppError::BadRequest(_)));

        let err: AppError = anyhow::anyhow!("boom").into();
        assert_eq!(err.to_string(), "Internal error: boom");
    }
}
