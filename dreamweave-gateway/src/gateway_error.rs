//! # Gateway Error Types
//!
//! The HTTP-facing error type and its response mapping. The status policy
//! is deliberate: generation returns 200 even when the artifact came from
//! the emergency fallback; 4xx is reserved for malformed requests; 5xx
//! appears only when even fallback synthesis failed.
//!
//! Wire errors are sanitized: callers get a stable `kind` string from the
//! taxonomy and a short message. Internal causes stay in the logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dreamweave_providers::{ErrorKind, ErrorRecord};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed or invalid request from the caller
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Unknown resource (provider name, route parameter)
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Terminal failure after every provider and the fallback failed
    #[error("Generation failed: {0:?}")]
    Terminal(Box<ErrorRecord>),

    /// Internal gateway error
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }
}

impl From<ErrorRecord> for GatewayError {
    fn from(record: ErrorRecord) -> Self {
        Self::Terminal(Box::new(record))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            GatewayError::InvalidRequest { message } => (
                StatusCode::BAD_REQUEST,
                ErrorKind::ClientError.as_str(),
                message.clone(),
            ),
            GatewayError::NotFound { message } => (
                StatusCode::NOT_FOUND,
                ErrorKind::ClientError.as_str(),
                message.clone(),
            ),
            GatewayError::Terminal(record) => {
                // The internal cause is logged at the failure site and
                // never placed on the wire.
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    record.kind.as_str(),
                    "generation failed and no fallback was possible".to_string(),
                )
            }
            GatewayError::Internal { message } => {
                tracing::error!("internal error: {message}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::Unknown.as_str(),
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "kind": kind,
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_requests_map_to_400() {
        let response = GatewayError::invalid("text is required").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn terminal_errors_map_to_500_with_stable_kind() {
        let record = ErrorRecord::new(ErrorKind::FallbackFailed, "req-1")
            .with_cause("internal detail that must not leak");
        let response = GatewayError::from(record).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
