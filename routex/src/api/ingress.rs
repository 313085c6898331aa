//! Hot-path ingress handlers
//!
//! Three dialect endpoints feed one pipeline: bodies are normalized to the
//! canonical Anthropic shape before routing, and buffered responses are
//! rendered back into the caller's dialect. Streamed frames are relayed
//! verbatim regardless of dialect.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{Error, HotPathError, Result};
use crate::models::RequestContext;
use crate::proxy::ProxyReply;
use crate::state::AppState;
use crate::transform::dialect::{self, Dialect};
use crate::transform::{gemini, openai};

/// Handler result rendering errors in the vendor wire shape, not the admin
/// envelope
type HotPathResult<T> = std::result::Result<T, HotPathError>;

/// `POST /v1/messages` -- Anthropic-native ingress
///
/// OpenAI-shaped bodies are accepted here too and normalized on entry.
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> HotPathResult<Response> {
    let canonical = match dialect::detect(&body) {
        Dialect::OpenAi => openai::request_to_anthropic(&body)?,
        _ => body,
    };
    let ctx = request_context(&headers, "/v1/messages", &canonical)?;

    match state.engine.handle(ctx, canonical).await? {
        ProxyReply::Json { status, body } => Ok(json_response(status, &body)),
        ProxyReply::Stream { body } => Ok(sse_response(body)),
    }
}

/// `POST /v1/chat/completions` -- OpenAI-native ingress
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> HotPathResult<Response> {
    let canonical = openai::request_to_anthropic(&body)?;
    let ctx = request_context(&headers, "/v1/chat/completions", &canonical)?;

    match state.engine.handle(ctx, canonical).await? {
        ProxyReply::Json { status, body } => {
            let rendered = openai::response_from_anthropic(&body)?;
            Ok(json_response(status, &rendered))
        }
        ProxyReply::Stream { body } => Ok(sse_response(body)),
    }
}

/// `POST /v1/models/{model}:generateContent` -- Gemini-native ingress
///
/// The final path segment arrives as `model:action`; `streamGenerateContent`
/// selects SSE regardless of the body.
pub async fn generate_content(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> HotPathResult<Response> {
    let (model, action) = model_action
        .split_once(':')
        .ok_or_else(|| Error::BadRequest("expected {model}:generateContent".to_string()))?;
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(HotPathError(Error::BadRequest(format!(
                "unsupported Gemini action '{}'",
                other
            ))))
        }
    };

    let mut canonical = gemini::request_to_anthropic(&body, model)?;
    if stream {
        canonical["stream"] = Value::Bool(true);
    }
    let path = format!("/v1/models/{}", model_action);
    let ctx = request_context(&headers, &path, &canonical)?;

    match state.engine.handle(ctx, canonical).await? {
        ProxyReply::Json { status, body } => {
            let rendered = gemini::response_from_anthropic(&body)?;
            Ok(json_response(status, &rendered))
        }
        ProxyReply::Stream { body } => Ok(sse_response(body)),
    }
}

/// Build the routing/transform context from ingress data
fn request_context(headers: &HeaderMap, path: &str, body: &Value) -> Result<RequestContext> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::BadRequest("missing 'model'".to_string()))?
        .to_string();

    let mut header_map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }

    let user_id = header_map.get("x-user-id").cloned().or_else(|| {
        body.get("metadata")
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str)
            .map(String::from)
    });
    let tags = header_map
        .get("x-routex-tags")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    let request_id = header_map
        .get("x-request-id")
        .cloned()
        .unwrap_or_else(|| format!("req_{}", uuid::Uuid::new_v4().simple()));

    Ok(RequestContext {
        model,
        path: path.to_string(),
        method: "POST".to_string(),
        headers: header_map,
        user_id,
        tags,
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
        request_id,
    })
}

fn json_response(status: StatusCode, body: &Value) -> Response {
    (status, Json(body.clone())).into_response()
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
