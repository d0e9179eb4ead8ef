//! # Error Handling
//!
//! This module defines the HTTP-facing error type and how it is converted to a response.
//! Domain errors (registry, ingest) live next to the code that raises them and are
//! converted into [`AppError`] at the handler boundary with `From` impls, so handlers
//! can simply use `?`.
//!
//! ## Error Envelope:
//! Every non-2xx response produced by the gateway has the same shape:
//! ```json
//! { "error": "session not found: sess_1234", "code": 404 }
//! ```
//! Framework-generated errors (unknown routes, oversized bodies) are rewritten into the
//! same envelope by `middleware::errors`.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ingest::IngestError;
use crate::session::RegistryError;

/// Custom error types for the gateway's HTTP surface.
///
/// ## Error Categories:
/// - **NotFound**: Unknown session or correlation id (404)
/// - **BadRequest**: Malformed payload or upgrade request (400)
/// - **PayloadTooLarge**: Body above the configured bound (413)
/// - **Unavailable**: Capacity exhausted, try again later (503)
/// - **Internal**: Registry or sink failure (500)
#[derive(Debug)]
pub enum AppError {
    /// Requested resource was not found
    NotFound(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Request body exceeded the configured limit
    PayloadTooLarge(String),

    /// The gateway is at capacity
    Unavailable(String),

    /// Internal server errors
    Internal(String),
}

/// The JSON body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses with the shared envelope.
///
/// ## HTTP Status Code Mapping:
/// - NotFound → 404
/// - BadRequest → 400
/// - PayloadTooLarge → 413
/// - Unavailable → 503
/// - Internal → 500
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        HttpResponse::build(status).json(ErrorBody {
            error: self.to_string(),
            code: status.as_u16(),
        })
    }
}

/// Registry errors are recoverable and always reported to the caller.
impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => AppError::NotFound(err.to_string()),
            RegistryError::CapacityExhausted(_) => AppError::Unavailable(err.to_string()),
            RegistryError::IdCollision(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Empty => AppError::BadRequest(err.to_string()),
            IngestError::TooLarge { .. } => AppError::PayloadTooLarge(err.to_string()),
            IngestError::Saturated { .. } => AppError::Unavailable(err.to_string()),
        }
    }
}

/// Type alias for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_error_envelope_shape() {
        let err = AppError::NotFound("session not found: sess_x".to_string());
        let response = err.error_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body()).await.unwrap();
        let parsed: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.code, 404);
        assert!(parsed.error.contains("sess_x"));
    }

    #[test]
    fn test_registry_error_mapping() {
        let err: AppError = RegistryError::NotFound("sess_a".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: AppError = RegistryError::CapacityExhausted(3).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err: AppError = IngestError::TooLarge { size: 10, limit: 5 }.into();
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);

        let err: AppError = IngestError::Saturated { in_flight: 8 }.into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
