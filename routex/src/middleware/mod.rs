//! Ingress middleware
//!
//! Stack order, outermost first: panic recovery, request-id injection, rate
//! limiting, signature verification (which buffers the body once and passes
//! the buffer down). Handlers behind the stack can rely on `x-request-id`
//! being present and the body being intact.

mod rate_limit;
mod signature;

pub use rate_limit::{preset, RateLimitDecision, RateLimitLayer, RateLimiter};
pub use signature::SignatureLayer;

use axum::http::Request;
use http::HeaderValue;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestId, RequestId, SetRequestIdLayer},
    sensitive_headers::SetSensitiveRequestHeadersLayer,
};
use uuid::Uuid;

/// Headers masked in trace output
pub const SENSITIVE_HEADERS: &[&str] = &["authorization", "x-api-key", "x-signature"];

/// Request-id generator: `req_<uuid-simple>`
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeGatewayRequestId;

impl MakeRequestId for MakeGatewayRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = format!("req_{}", Uuid::new_v4().simple());
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

/// Layer injecting `x-request-id` when the caller did not send one
pub fn request_id_layer() -> SetRequestIdLayer<MakeGatewayRequestId> {
    SetRequestIdLayer::x_request_id(MakeGatewayRequestId)
}

/// Layer converting handler panics into plain 500 responses
pub fn recovery_layer() -> CatchPanicLayer<tower_http::catch_panic::DefaultResponseForPanic> {
    CatchPanicLayer::new()
}

/// Layer masking credential-bearing headers in logs
pub fn sensitive_headers_layer() -> SetSensitiveRequestHeadersLayer {
    let headers = SENSITIVE_HEADERS
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect::<Vec<_>>();
    SetSensitiveRequestHeadersLayer::new(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_request_id_shape() {
        let request = Request::builder().body(Body::empty()).unwrap();
        let id = MakeGatewayRequestId
            .make_request_id(&request)
            .expect("id generated");
        let value = id.header_value().to_str().unwrap();
        assert!(value.starts_with("req_"));
        assert_eq!(value.len(), 4 + 32);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let request = Request::builder().body(Body::empty()).unwrap();
        let a = MakeGatewayRequestId.make_request_id(&request).unwrap();
        let b = MakeGatewayRequestId.make_request_id(&request).unwrap();
        assert_ne!(a.header_value(), b.header_value());
    }

    #[test]
    fn test_sensitive_headers_include_credentials() {
        assert!(SENSITIVE_HEADERS.contains(&"authorization"));
        assert!(SENSITIVE_HEADERS.contains(&"x-api-key"));
        assert!(SENSITIVE_HEADERS.contains(&"x-signature"));
    }
}
