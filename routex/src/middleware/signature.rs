//! HMAC request-signature verification
//!
//! Reads `x-signature` and `x-timestamp`, buffers the body exactly once at
//! middleware entry, verifies the canonical string, and reinserts the buffer
//! so downstream extractors see the same payload the HMAC covered.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;

use crate::config::SignatureConfig;
use crate::crypto;
use crate::error::{Error, Result};

/// Maximum buffered body during verification
const MAX_SIGNED_BODY: usize = 16 * 1024 * 1024;

/// Shared state for the signature middleware
#[derive(Clone)]
pub struct SignatureLayer {
    config: SignatureConfig,
}

impl SignatureLayer {
    /// Build middleware state
    pub fn new(config: SignatureConfig) -> Self {
        Self { config }
    }

    /// Axum middleware entry point
    pub async fn middleware(
        State(layer): State<Self>,
        request: Request<Body>,
        next: Next,
    ) -> Result<Response> {
        if !layer.config.enabled {
            return Ok(next.run(request).await);
        }

        let signature = request
            .headers()
            .get("x-signature")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(Error::SignatureInvalid)?;
        let timestamp: i64 = request
            .headers()
            .get("x-timestamp")
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::SignatureInvalid)?
            .parse()
            .map_err(|_| Error::SignatureInvalid)?;

        crypto::verify_timestamp(timestamp, Utc::now().timestamp(), layer.config.tolerance_secs)?;

        let signed_headers: Vec<(String, String)> = layer
            .config
            .signed_headers
            .iter()
            .map(|name| {
                let value = request
                    .headers()
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (name.clone(), value)
            })
            .collect();

        let method = request.method().as_str().to_string();
        let path = request.uri().path().to_string();

        // Single body read; the buffer is handed back to the request below
        let (parts, body) = request.into_parts();
        let bytes = to_bytes(body, MAX_SIGNED_BODY)
            .await
            .map_err(|e| Error::BadRequest(format!("body read failed: {}", e)))?;
        let body_str = std::str::from_utf8(&bytes)
            .map_err(|_| Error::BadRequest("body is not valid UTF-8".to_string()))?;

        crypto::verify_signature(
            &layer.config.secret,
            &signature,
            &method,
            &path,
            timestamp,
            body_str,
            &signed_headers,
        )?;

        let request = Request::from_parts(parts, Body::from(bytes));
        Ok(next.run(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, routing::post, Router};
    use tower::ServiceExt;

    fn app(config: SignatureConfig) -> Router {
        let layer = SignatureLayer::new(config);
        Router::new()
            .route("/v1/messages", post(|body: String| async move { body }))
            .layer(middleware::from_fn_with_state(
                layer,
                SignatureLayer::middleware,
            ))
    }

    fn config(enabled: bool) -> SignatureConfig {
        SignatureConfig {
            enabled,
            secret: "shared-secret".to_string(),
            tolerance_secs: 300,
            signed_headers: Vec::new(),
        }
    }

    fn signed_request(body: &str, timestamp: i64, secret: &str) -> Request<Body> {
        let signature =
            crypto::compute_signature(secret, "POST", "/v1/messages", timestamp, body, &[]);
        Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("x-signature", signature)
            .header("x-timestamp", timestamp.to_string())
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_signature_passes_and_body_survives() {
        let now = Utc::now().timestamp();
        let response = app(config(true))
            .oneshot(signed_request("{\"model\":\"m\"}", now, "shared-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        // Downstream saw the same buffered body
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"{\"model\":\"m\"}");
    }

    #[tokio::test]
    async fn test_missing_headers_rejected() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .body(Body::from("{}"))
            .unwrap();
        let response = app(config(true)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let now = Utc::now().timestamp();
        let response = app(config(true))
            .oneshot(signed_request("{}", now, "other-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn test_stale_timestamp_rejected() {
        let stale = Utc::now().timestamp() - 301;
        let response = app(config(true))
            .oneshot(signed_request("{}", stale, "shared-secret"))
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn test_disabled_layer_passes_everything() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .body(Body::from("{}"))
            .unwrap();
        let response = app(config(false)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), 200);
    }
}
