//! OpenAI Chat Completions bridge
//!
//! Bidirectional translation between the canonical Anthropic Messages shape
//! and the OpenAI dialect. The free functions are used both by this
//! transformer (outbound to OpenAI-family channels) and by the ingress when a
//! caller speaks OpenAI natively.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::dialect::{self, Dialect};
use super::Transformer;
use crate::error::{Error, Result};
use crate::models::RequestContext;

fn bridge_err(message: impl Into<String>) -> Error {
    Error::TransformError {
        transformer: "openai".to_string(),
        message: message.into(),
    }
}

/// Canonical Anthropic request → OpenAI Chat Completions request
pub fn request_from_anthropic(body: &Value) -> Result<Value> {
    let mut out = Map::new();

    let model = body.get("model").and_then(Value::as_str).unwrap_or_default();
    out.insert(
        "model".to_string(),
        Value::String(dialect::map_model(model, Dialect::OpenAi)),
    );

    let mut messages = Vec::new();

    // Top-level system prompt becomes the leading system message
    if let Some(system) = body.get("system") {
        let text = match system {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

    for message in body
        .get("messages")
        .and_then(Value::as_array)
        .unwrap_or(&Vec::new())
    {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        match message.get("content") {
            Some(Value::String(text)) => {
                messages.push(json!({"role": role, "content": text}));
            }
            Some(Value::Array(blocks)) => {
                convert_blocks_to_openai(role, blocks, &mut messages)?;
            }
            _ => {}
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));

    if let Some(max_tokens) = body.get("max_tokens") {
        out.insert("max_tokens".to_string(), max_tokens.clone());
    }
    for field in ["temperature", "top_p", "stream"] {
        if let Some(value) = body.get(field) {
            out.insert(field.to_string(), value.clone());
        }
    }
    if let Some(stop) = body.get("stop_sequences") {
        out.insert("stop".to_string(), stop.clone());
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("input_schema").cloned().unwrap_or(json!({})),
                    }
                })
            })
            .collect();
        out.insert("tools".to_string(), Value::Array(mapped));
    }

    Ok(Value::Object(out))
}

fn convert_blocks_to_openai(
    role: &str,
    blocks: &[Value],
    messages: &mut Vec<Value>,
) -> Result<()> {
    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                parts.push(json!({
                    "type": "text",
                    "text": block.get("text").cloned().unwrap_or(Value::Null)
                }));
            }
            Some("image") => {
                let source = block.get("source").ok_or_else(|| {
                    bridge_err("image block without source")
                })?;
                let media_type = source
                    .get("media_type")
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                let data = source.get("data").and_then(Value::as_str).unwrap_or("");
                parts.push(json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{};base64,{}", media_type, data)}
                }));
            }
            Some("tool_use") => {
                let arguments = serde_json::to_string(
                    block.get("input").unwrap_or(&json!({})),
                )
                .map_err(|e| bridge_err(format!("tool input serialization: {}", e)))?;
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": arguments,
                    }
                }));
            }
            Some("tool_result") => {
                let content = match block.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => serde_json::to_string(other)
                        .map_err(|e| bridge_err(format!("tool result serialization: {}", e)))?,
                    None => String::new(),
                };
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
                    "content": content,
                }));
            }
            _ => {}
        }
    }

    if !parts.is_empty() || !tool_calls.is_empty() {
        let mut message = Map::new();
        message.insert("role".to_string(), Value::String(role.to_string()));
        // A single text part collapses to the plain-string form
        let content = if parts.len() == 1 && parts[0].get("type") == Some(&json!("text")) {
            parts[0].get("text").cloned().unwrap_or(Value::Null)
        } else if parts.is_empty() {
            Value::Null
        } else {
            Value::Array(parts)
        };
        message.insert("content".to_string(), content);
        if !tool_calls.is_empty() {
            message.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }
        messages.push(Value::Object(message));
    }
    Ok(())
}

/// OpenAI Chat Completions request → canonical Anthropic request
pub fn request_to_anthropic(body: &Value) -> Result<Value> {
    let mut out = Map::new();

    let model = body.get("model").and_then(Value::as_str).unwrap_or_default();
    out.insert("model".to_string(), Value::String(model.to_string()));

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in body
        .get("messages")
        .and_then(Value::as_array)
        .unwrap_or(&Vec::new())
    {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        match role {
            "system" | "developer" => {
                if let Some(text) = message.get("content").and_then(Value::as_str) {
                    system_parts.push(text.to_string());
                }
            }
            "tool" => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": message.get("tool_call_id").cloned().unwrap_or(Value::Null),
                        "content": message.get("content").cloned().unwrap_or(Value::Null),
                    }]
                }));
            }
            role => {
                let mut blocks = Vec::new();
                match message.get("content") {
                    Some(Value::String(text)) => {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                    Some(Value::Array(parts)) => {
                        for part in parts {
                            match part.get("type").and_then(Value::as_str) {
                                Some("text") => blocks.push(json!({
                                    "type": "text",
                                    "text": part.get("text").cloned().unwrap_or(Value::Null)
                                })),
                                Some("image_url") => {
                                    let url = part
                                        .get("image_url")
                                        .and_then(|i| i.get("url"))
                                        .and_then(Value::as_str)
                                        .unwrap_or("");
                                    if let Some(block) = image_block_from_data_url(url) {
                                        blocks.push(block);
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
                if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
                    for call in tool_calls {
                        let arguments = call
                            .get("function")
                            .and_then(|f| f.get("arguments"))
                            .and_then(Value::as_str)
                            .unwrap_or("{}");
                        let input: Value =
                            serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.get("id").cloned().unwrap_or(Value::Null),
                            "name": call
                                .get("function")
                                .and_then(|f| f.get("name"))
                                .cloned()
                                .unwrap_or(Value::Null),
                            "input": input,
                        }));
                    }
                }
                if !blocks.is_empty() {
                    messages.push(json!({"role": role, "content": blocks}));
                }
            }
        }
    }

    if !system_parts.is_empty() {
        out.insert("system".to_string(), Value::String(system_parts.join("\n")));
    }
    out.insert("messages".to_string(), Value::Array(messages));

    if let Some(max_tokens) = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
    {
        out.insert("max_tokens".to_string(), max_tokens.clone());
    }
    for field in ["temperature", "top_p", "stream"] {
        if let Some(value) = body.get(field) {
            out.insert(field.to_string(), value.clone());
        }
    }
    if let Some(stop) = body.get("stop") {
        out.insert("stop_sequences".to_string(), stop.clone());
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools
            .iter()
            .filter_map(|tool| tool.get("function"))
            .map(|function| {
                json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "input_schema": function.get("parameters").cloned().unwrap_or(json!({})),
                })
            })
            .collect();
        out.insert("tools".to_string(), Value::Array(mapped));
    }

    Ok(Value::Object(out))
}

fn image_block_from_data_url(url: &str) -> Option<Value> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some(json!({
        "type": "image",
        "source": {"type": "base64", "media_type": media_type, "data": data}
    }))
}

/// OpenAI response → canonical Anthropic response
pub fn response_to_anthropic(body: &Value) -> Result<Value> {
    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| bridge_err("response has no choices"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| bridge_err("choice has no message"))?;

    let mut blocks = Vec::new();
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            blocks.push(json!({"type": "text", "text": text}));
        }
    }
    if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in tool_calls {
            let arguments = call
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
                .unwrap_or("{}");
            let input: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
            blocks.push(json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": call
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .cloned()
                    .unwrap_or(Value::Null),
                "input": input,
            }));
        }
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop");
    let usage = dialect::extract_usage(body);

    Ok(json!({
        "id": body.get("id").cloned().unwrap_or(Value::String(format!("msg_{}", Uuid::new_v4()))),
        "type": "message",
        "role": "assistant",
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "content": blocks,
        "stop_reason": dialect::finish_reason_to_anthropic(finish_reason),
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": usage.input,
            "output_tokens": usage.output,
            "cache_read_input_tokens": usage.cached,
        }
    }))
}

/// Canonical Anthropic response → OpenAI response (for OpenAI-native callers)
pub fn response_from_anthropic(body: &Value) -> Result<Value> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in &blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                let arguments = serde_json::to_string(block.get("input").unwrap_or(&json!({})))
                    .map_err(|e| bridge_err(format!("tool input serialization: {}", e)))?;
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": arguments,
                    }
                }));
            }
            _ => {}
        }
    }

    let stop_reason = body
        .get("stop_reason")
        .and_then(Value::as_str)
        .unwrap_or("end_turn");
    let usage = dialect::extract_usage(body);

    let mut message = json!({
        "role": "assistant",
        "content": if text.is_empty() { Value::Null } else { Value::String(text) },
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    Ok(json!({
        "id": body.get("id").cloned().unwrap_or(Value::Null),
        "object": "chat.completion",
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": dialect::stop_reason_to_openai(stop_reason),
        }],
        "usage": {
            "prompt_tokens": usage.input,
            "completion_tokens": usage.output,
            "total_tokens": usage.input + usage.output,
        }
    }))
}

/// Settings for [`OpenAiBridge`]
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiBridgeConfig {
    /// Pipeline position
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Whether the slot runs
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> i64 {
    100
}

fn default_enabled() -> bool {
    true
}

/// Transformer converting bodies to and from the OpenAI dialect
#[derive(Debug)]
pub struct OpenAiBridge {
    config: OpenAiBridgeConfig,
}

impl OpenAiBridge {
    /// Build from JSON settings
    pub fn from_config(settings: Value) -> Result<Self> {
        let config: OpenAiBridgeConfig = serde_json::from_value(settings)
            .map_err(|e| Error::Config(format!("openai bridge settings: {}", e)))?;
        Ok(Self { config })
    }
}

#[async_trait]
impl Transformer for OpenAiBridge {
    fn id(&self) -> &str {
        "openai"
    }

    fn priority(&self) -> i64 {
        self.config.priority
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn transform_request(&self, body: Value, _ctx: &RequestContext) -> Result<Value> {
        request_from_anthropic(&body)
    }

    async fn transform_response(&self, body: Value, _ctx: &RequestContext) -> Result<Value> {
        // Already canonical (e.g. served by an Anthropic channel): pass through
        if body.get("choices").is_none() {
            return Ok(body);
        }
        response_to_anthropic(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anthropic_request() -> Value {
        json!({
            "model": "claude-opus-4",
            "max_tokens": 1024,
            "system": "be brief",
            "temperature": 0.7,
            "stop_sequences": ["END"],
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "what is in this image?"},
                    {"type": "image", "source": {
                        "type": "base64", "media_type": "image/png", "data": "aGVsbG8="
                    }}
                ]},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "lookup",
                     "input": {"q": "cats"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "found 3"}
                ]}
            ],
            "tools": [
                {"name": "lookup", "description": "search", "input_schema": {"type": "object"}}
            ]
        })
    }

    #[test]
    fn test_request_from_anthropic_full_shape() {
        let out = request_from_anthropic(&anthropic_request()).unwrap();

        assert_eq!(out["model"], "gpt-4o");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be brief");

        // Multi-part user turn keeps text + data-url image
        let parts = messages[1]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/png;base64,aGVsbG8="
        );

        // tool_use becomes tool_calls with stringified arguments
        let call = &messages[2]["tool_calls"][0];
        assert_eq!(call["function"]["name"], "lookup");
        assert_eq!(call["function"]["arguments"], "{\"q\":\"cats\"}");

        // tool_result becomes a tool-role message
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "toolu_1");

        assert_eq!(out["stop"], json!(["END"]));
        assert_eq!(out["tools"][0]["function"]["name"], "lookup");
    }

    #[test]
    fn test_request_round_trip_preserves_meaning() {
        let openai = request_from_anthropic(&anthropic_request()).unwrap();
        let back = request_to_anthropic(&openai).unwrap();

        assert_eq!(back["system"], "be brief");
        assert_eq!(back["max_tokens"], 1024);
        assert_eq!(back["stop_sequences"], json!(["END"]));
        let messages = back["messages"].as_array().unwrap();
        let first_blocks = messages[0]["content"].as_array().unwrap();
        assert_eq!(first_blocks[0]["text"], "what is in this image?");
        assert_eq!(first_blocks[1]["source"]["data"], "aGVsbG8=");
        assert_eq!(back["tools"][0]["input_schema"], json!({"type": "object"}));
    }

    #[test]
    fn test_response_to_anthropic() {
        let openai = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "hello",
                    "tool_calls": [{
                        "id": "call_1", "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"q\":\"cats\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5}
        });

        let out = response_to_anthropic(&openai).unwrap();
        assert_eq!(out["type"], "message");
        assert_eq!(out["content"][0]["text"], "hello");
        assert_eq!(out["content"][1]["type"], "tool_use");
        assert_eq!(out["content"][1]["input"], json!({"q": "cats"}));
        assert_eq!(out["stop_reason"], "tool_use");
        assert_eq!(out["usage"]["input_tokens"], 12);
    }

    #[test]
    fn test_response_from_anthropic() {
        let canonical = json!({
            "id": "msg_1",
            "model": "claude-opus-4",
            "content": [{"type": "text", "text": "hi there"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 3, "output_tokens": 9}
        });

        let out = response_from_anthropic(&canonical).unwrap();
        assert_eq!(out["object"], "chat.completion");
        assert_eq!(out["choices"][0]["message"]["content"], "hi there");
        assert_eq!(out["choices"][0]["finish_reason"], "length");
        assert_eq!(out["usage"]["total_tokens"], 12);
    }

    #[tokio::test]
    async fn test_bridge_passes_canonical_response_through() {
        let bridge = OpenAiBridge::from_config(json!({})).unwrap();
        let canonical = json!({"type": "message", "content": []});
        let out = bridge
            .transform_response(canonical.clone(), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(out, canonical);
    }
}
