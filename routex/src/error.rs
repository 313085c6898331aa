//! Error types and HTTP response conversion

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the gateway error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (bad or missing settings, fatal at boot)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed request: bad JSON, unknown model in strict mode, transform rejection
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// HMAC signature did not verify
    #[error("Invalid request signature")]
    SignatureInvalid,

    /// Signed timestamp outside the tolerance window
    #[error("Request timestamp outside allowed window")]
    TimestampOutOfWindow,

    /// Ingress rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Seconds until the current window resets
        retry_after_secs: u64,
    },

    /// No eligible channel for the requested model
    #[error("No channel available for model '{model}'")]
    NoChannelAvailable {
        /// Model requested by the caller
        model: String,
    },

    /// A routing rule named a channel that is not currently eligible
    #[error("Routed channel '{channel}' is unavailable")]
    RoutedChannelUnavailable {
        /// Channel named by the matching rule
        channel: String,
    },

    /// Strict max-token policy rejected the request
    #[error("max_tokens {requested} exceeds limit {limit}")]
    TokenLimitExceeded {
        /// Value the caller asked for
        requested: u32,
        /// Configured ceiling
        limit: u32,
    },

    /// A transformer failed while rewriting a request or buffered response
    #[error("Transform '{transformer}' failed: {message}")]
    TransformError {
        /// Transformer id
        transformer: String,
        /// Failure detail
        message: String,
    },

    /// Ciphertext had the wrong shape or failed authentication
    #[error("Ciphertext is malformed or fails authentication")]
    BadCiphertext,

    /// Terminal upstream failure after retries
    #[error("Upstream returned status {status}")]
    UpstreamError {
        /// Upstream HTTP status
        status: u16,
        /// Upstream body, passed through when present
        body: Option<String>,
    },

    /// Upstream attempt timed out
    #[error("Upstream request timed out")]
    Timeout,

    /// Persistent store failure
    #[error("Database error: {0}")]
    Database(String),

    /// Resource not found on the admin surface
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate name or conflicting admin write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error; details are logged, never returned
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable kind, used in response bodies and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::BadRequest(_) => "bad_request",
            Error::Unauthorized(_) => "unauthorized",
            Error::SignatureInvalid => "signature_invalid",
            Error::TimestampOutOfWindow => "timestamp_out_of_window",
            Error::RateLimited { .. } => "rate_limited",
            Error::NoChannelAvailable { .. } => "no_channel_available",
            Error::RoutedChannelUnavailable { .. } => "routed_channel_unavailable",
            Error::TokenLimitExceeded { .. } => "token_limit_exceeded",
            Error::TransformError { .. } => "transform_error",
            Error::BadCiphertext => "bad_ciphertext",
            Error::UpstreamError { .. } => "upstream_error",
            Error::Timeout => "timeout",
            Error::Database(_) => "database_error",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Internal(_) => "internal_error",
        }
    }

    /// HTTP status this error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_)
            | Error::TokenLimitExceeded { .. }
            | Error::TransformError { .. } => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) | Error::SignatureInvalid | Error::TimestampOutOfWindow => {
                StatusCode::UNAUTHORIZED
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::NoChannelAvailable { .. } | Error::RoutedChannelUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::UpstreamError { status, .. } => {
                // Client-class upstream statuses pass through; transport-class map to 502
                StatusCode::from_u16(*status)
                    .ok()
                    .filter(|s| s.is_client_error())
                    .unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Config(_)
            | Error::BadCiphertext
            | Error::Database(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when a proxy attempt hitting this error may be retried on another channel
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::UpstreamError { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            _ => false,
        }
    }
}

/// Body of the error half of the admin envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error kind
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable message
    pub message: String,
}

/// JSON error response: `{ "success": false, "error": { "type", "message" } }`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false
    pub success: bool,
    /// Error detail
    pub error: ErrorBody,
}

impl ErrorResponse {
    /// Build the response body for an error
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                kind: kind.into(),
                message: message.into(),
            },
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error.message)
    }
}

impl Error {
    /// Message safe to return to callers; internal detail stays in the logs
    fn public_message(&self) -> String {
        match self {
            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            Error::Database(msg) => {
                tracing::error!("Database error: {}", msg);
                "Storage operation failed".to_string()
            }
            Error::BadCiphertext => {
                tracing::error!("Credential decryption failed");
                "Credential decryption failed".to_string()
            }
            Error::UpstreamError {
                status,
                body: Some(body),
            } => {
                tracing::warn!(upstream_status = status, "Upstream error passed through");
                body.clone()
            }
            other => other.to_string(),
        }
    }
}

fn apply_retry_after(err: &Error, response: &mut Response) {
    if let Error::RateLimited { retry_after_secs } = err {
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.public_message();

        let mut response =
            (status, Json(ErrorResponse::new(self.kind(), message))).into_response();
        apply_retry_after(&self, &mut response);
        response
    }
}

/// Error wrapper for the hot-path endpoints
///
/// Vendor-facing routes answer errors in the Anthropic wire shape,
/// `{ "type": "error", "error": { "type", "message" } }`, not the admin
/// envelope. Status mapping and Retry-After handling are shared with
/// [`Error`].
#[derive(Debug)]
pub struct HotPathError(pub Error);

impl From<Error> for HotPathError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for HotPathError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = err.status();
        let body = serde_json::json!({
            "type": "error",
            "error": {
                "type": err.kind(),
                "message": err.public_message(),
            }
        });

        let mut response = (status, Json(body)).into_response();
        apply_retry_after(&err, &mut response);
        response
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::BadRequest(format!("invalid JSON: {}", err))
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::SignatureInvalid.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::RateLimited {
                retry_after_secs: 30
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::NoChannelAvailable {
                model: "claude-opus-4".into()
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(Error::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_upstream_status_passthrough() {
        // 4xx from upstream is preserved
        let err = Error::UpstreamError {
            status: 404,
            body: None,
        };
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        // 5xx maps to 502
        let err = Error::UpstreamError {
            status: 503,
            body: None,
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_retriable_classification() {
        assert!(Error::Timeout.is_retriable());
        assert!(Error::UpstreamError {
            status: 502,
            body: None
        }
        .is_retriable());
        assert!(Error::UpstreamError {
            status: 429,
            body: None
        }
        .is_retriable());
        assert!(Error::UpstreamError {
            status: 408,
            body: None
        }
        .is_retriable());
        assert!(!Error::UpstreamError {
            status: 401,
            body: None
        }
        .is_retriable());
        assert!(!Error::BadRequest("x".into()).is_retriable());
        assert!(!Error::TransformError {
            transformer: "maxtoken".into(),
            message: "over limit".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_error_response_shape() {
        let body = ErrorResponse::new("bad_request", "missing field");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["type"], "bad_request");
        assert_eq!(json["error"]["message"], "missing field");
    }

    #[tokio::test]
    async fn test_hot_path_error_body_is_vendor_shaped() {
        let err = HotPathError(Error::NoChannelAvailable {
            model: "claude-opus-4".into(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "no_channel_available");
        assert!(body.get("success").is_none(), "no envelope field");
    }

    #[tokio::test]
    async fn test_hot_path_rate_limit_keeps_retry_after() {
        let err = HotPathError(Error::RateLimited {
            retry_after_secs: 12,
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "12");
    }
}
