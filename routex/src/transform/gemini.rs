//! Google Gemini generateContent bridge
//!
//! Bidirectional translation between the canonical Anthropic Messages shape
//! and the Gemini dialect. Gemini addresses tool results by function name
//! rather than call id, so the converter resolves names through the
//! conversation's earlier `tool_use` blocks.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use super::dialect::{self, Dialect};
use super::Transformer;
use crate::error::{Error, Result};
use crate::models::RequestContext;

fn bridge_err(message: impl Into<String>) -> Error {
    Error::TransformError {
        transformer: "gemini".to_string(),
        message: message.into(),
    }
}

/// Canonical Anthropic request → Gemini generateContent request
pub fn request_from_anthropic(body: &Value) -> Result<Value> {
    let mut out = Map::new();

    // Resolve tool_use ids to function names for functionResponse parts
    let mut tool_names: HashMap<String, String> = HashMap::new();
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            if let Some(blocks) = message.get("content").and_then(Value::as_array) {
                for block in blocks {
                    if block.get("type") == Some(&json!("tool_use")) {
                        if let (Some(id), Some(name)) = (
                            block.get("id").and_then(Value::as_str),
                            block.get("name").and_then(Value::as_str),
                        ) {
                            tool_names.insert(id.to_string(), name.to_string());
                        }
                    }
                }
            }
        }
    }

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
            out.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": text}]}),
            );
        }
    }

    let mut contents = Vec::new();
    for message in body
        .get("messages")
        .and_then(Value::as_array)
        .unwrap_or(&Vec::new())
    {
        let role = match message.get("role").and_then(Value::as_str) {
            Some("assistant") => "model",
            _ => "user",
        };
        let mut parts = Vec::new();

        match message.get("content") {
            Some(Value::String(text)) => parts.push(json!({"text": text})),
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => parts.push(json!({
                            "text": block.get("text").cloned().unwrap_or(Value::Null)
                        })),
                        Some("image") => {
                            let source = block
                                .get("source")
                                .ok_or_else(|| bridge_err("image block without source"))?;
                            parts.push(json!({
                                "inlineData": {
                                    "mimeType": source
                                        .get("media_type")
                                        .cloned()
                                        .unwrap_or(json!("image/png")),
                                    "data": source.get("data").cloned().unwrap_or(json!("")),
                                }
                            }));
                        }
                        Some("tool_use") => parts.push(json!({
                            "functionCall": {
                                "name": block.get("name").cloned().unwrap_or(Value::Null),
                                "args": block.get("input").cloned().unwrap_or(json!({})),
                            }
                        })),
                        Some("tool_result") => {
                            let name = block
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .and_then(|id| tool_names.get(id))
                                .cloned()
                                .unwrap_or_else(|| "unknown".to_string());
                            let response = match block.get("content") {
                                Some(Value::String(s)) => json!({"result": s}),
                                Some(other) => other.clone(),
                                None => json!({}),
                            };
                            parts.push(json!({
                                "functionResponse": {"name": name, "response": response}
                            }));
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }

        if !parts.is_empty() {
            contents.push(json!({"role": role, "parts": parts}));
        }
    }
    out.insert("contents".to_string(), Value::Array(contents));

    let mut generation = Map::new();
    if let Some(max_tokens) = body.get("max_tokens") {
        generation.insert("maxOutputTokens".to_string(), max_tokens.clone());
    }
    if let Some(temperature) = body.get("temperature") {
        generation.insert("temperature".to_string(), temperature.clone());
    }
    if let Some(top_p) = body.get("top_p") {
        generation.insert("topP".to_string(), top_p.clone());
    }
    if let Some(top_k) = body.get("top_k") {
        generation.insert("topK".to_string(), top_k.clone());
    }
    if let Some(stop) = body.get("stop_sequences") {
        generation.insert("stopSequences".to_string(), stop.clone());
    }
    if !generation.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(generation));
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.get("name").cloned().unwrap_or(Value::Null),
                    "description": tool.get("description").cloned().unwrap_or(Value::Null),
                    "parameters": tool.get("input_schema").cloned().unwrap_or(json!({})),
                })
            })
            .collect();
        out.insert(
            "tools".to_string(),
            json!([{"functionDeclarations": declarations}]),
        );
    }

    Ok(Value::Object(out))
}

/// Gemini generateContent request → canonical Anthropic request
pub fn request_to_anthropic(body: &Value, model: &str) -> Result<Value> {
    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(model.to_string()));

    if let Some(text) = body
        .get("systemInstruction")
        .and_then(|s| s.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|text| !text.is_empty())
    {
        out.insert("system".to_string(), Value::String(text));
    }

    let mut messages = Vec::new();
    for content in body
        .get("contents")
        .and_then(Value::as_array)
        .unwrap_or(&Vec::new())
    {
        let role = match content.get("role").and_then(Value::as_str) {
            Some("model") => "assistant",
            _ => "user",
        };
        let mut blocks = Vec::new();
        for part in content
            .get("parts")
            .and_then(Value::as_array)
            .unwrap_or(&Vec::new())
        {
            if let Some(text) = part.get("text") {
                blocks.push(json!({"type": "text", "text": text}));
            } else if let Some(inline) = part.get("inlineData") {
                blocks.push(json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": inline.get("mimeType").cloned().unwrap_or(json!("image/png")),
                        "data": inline.get("data").cloned().unwrap_or(json!("")),
                    }
                }));
            } else if let Some(call) = part.get("functionCall") {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": format!("toolu_{}", Uuid::new_v4().simple()),
                    "name": call.get("name").cloned().unwrap_or(Value::Null),
                    "input": call.get("args").cloned().unwrap_or(json!({})),
                }));
            } else if let Some(response) = part.get("functionResponse") {
                blocks.push(json!({
                    "type": "tool_result",
                    "tool_use_id": response.get("name").cloned().unwrap_or(Value::Null),
                    "content": response.get("response").cloned().unwrap_or(Value::Null),
                }));
            }
        }
        if !blocks.is_empty() {
            messages.push(json!({"role": role, "content": blocks}));
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));

    if let Some(generation) = body.get("generationConfig") {
        if let Some(max_tokens) = generation.get("maxOutputTokens") {
            out.insert("max_tokens".to_string(), max_tokens.clone());
        }
        if let Some(temperature) = generation.get("temperature") {
            out.insert("temperature".to_string(), temperature.clone());
        }
        if let Some(top_p) = generation.get("topP") {
            out.insert("top_p".to_string(), top_p.clone());
        }
        if let Some(top_k) = generation.get("topK") {
            out.insert("top_k".to_string(), top_k.clone());
        }
        if let Some(stop) = generation.get("stopSequences") {
            out.insert("stop_sequences".to_string(), stop.clone());
        }
    }

    Ok(Value::Object(out))
}

/// Gemini response → canonical Anthropic response
pub fn response_to_anthropic(body: &Value) -> Result<Value> {
    let candidate = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| bridge_err("response has no candidates"))?;

    let mut blocks = Vec::new();
    for part in candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .unwrap_or(&Vec::new())
    {
        if let Some(text) = part.get("text") {
            blocks.push(json!({"type": "text", "text": text}));
        } else if let Some(call) = part.get("functionCall") {
            blocks.push(json!({
                "type": "tool_use",
                "id": format!("toolu_{}", Uuid::new_v4().simple()),
                "name": call.get("name").cloned().unwrap_or(Value::Null),
                "input": call.get("args").cloned().unwrap_or(json!({})),
            }));
        }
    }

    let finish = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .unwrap_or("STOP");
    let usage = dialect::extract_usage(body);

    Ok(json!({
        "id": format!("msg_{}", Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": body.get("modelVersion").cloned().unwrap_or(Value::Null),
        "content": blocks,
        "stop_reason": dialect::gemini_finish_to_anthropic(finish),
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": usage.input,
            "output_tokens": usage.output,
            "cache_read_input_tokens": usage.cached,
        }
    }))
}

/// Canonical Anthropic response → Gemini response (for Gemini-native callers)
pub fn response_from_anthropic(body: &Value) -> Result<Value> {
    let mut parts = Vec::new();
    for block in body
        .get("content")
        .and_then(Value::as_array)
        .unwrap_or(&Vec::new())
    {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                parts.push(json!({"text": block.get("text").cloned().unwrap_or(Value::Null)}))
            }
            Some("tool_use") => parts.push(json!({
                "functionCall": {
                    "name": block.get("name").cloned().unwrap_or(Value::Null),
                    "args": block.get("input").cloned().unwrap_or(json!({})),
                }
            })),
            _ => {}
        }
    }

    let stop_reason = body
        .get("stop_reason")
        .and_then(Value::as_str)
        .unwrap_or("end_turn");
    let usage = dialect::extract_usage(body);

    Ok(json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": dialect::stop_reason_to_gemini(stop_reason),
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": usage.input,
            "candidatesTokenCount": usage.output,
            "totalTokenCount": usage.input + usage.output,
        },
        "modelVersion": body.get("model").cloned().unwrap_or(Value::Null),
    }))
}

/// Settings for [`GeminiBridge`]
#[derive(Debug, Clone, Deserialize)]
pub struct GeminiBridgeConfig {
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

/// Transformer converting bodies to and from the Gemini dialect
#[derive(Debug)]
pub struct GeminiBridge {
    config: GeminiBridgeConfig,
}

impl GeminiBridge {
    /// Build from JSON settings
    pub fn from_config(settings: Value) -> Result<Self> {
        let config: GeminiBridgeConfig = serde_json::from_value(settings)
            .map_err(|e| Error::Config(format!("gemini bridge settings: {}", e)))?;
        Ok(Self { config })
    }
}

#[async_trait]
impl Transformer for GeminiBridge {
    fn id(&self) -> &str {
        "gemini"
    }

    fn priority(&self) -> i64 {
        self.config.priority
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn transform_request(&self, body: Value, _ctx: &RequestContext) -> Result<Value> {
        let mut out = request_from_anthropic(&body)?;
        // The Gemini model rides in the URL, but keep the mapped name on the
        // body so the proxy can build the path
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            out["model"] = Value::String(dialect::map_model(model, Dialect::Gemini));
        }
        Ok(out)
    }

    async fn transform_response(&self, body: Value, _ctx: &RequestContext) -> Result<Value> {
        if body.get("candidates").is_none() {
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
            "max_tokens": 2048,
            "temperature": 0.3,
            "top_k": 40,
            "system": "answer in French",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "describe this"},
                    {"type": "image", "source": {
                        "type": "base64", "media_type": "image/jpeg", "data": "Zm9v"
                    }}
                ]},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_9", "name": "weather",
                     "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_9", "content": "sunny"}
                ]}
            ],
            "tools": [{"name": "weather", "description": "forecast",
                       "input_schema": {"type": "object"}}]
        })
    }

    #[test]
    fn test_request_from_anthropic_shape() {
        let out = request_from_anthropic(&anthropic_request()).unwrap();

        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "answer in French");

        let contents = out["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "weather");
        // tool_result resolves back to the function name
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["name"],
            "weather"
        );
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["result"],
            "sunny"
        );

        assert_eq!(out["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(out["generationConfig"]["topK"], 40);
        assert_eq!(
            out["tools"][0]["functionDeclarations"][0]["name"],
            "weather"
        );
    }

    #[test]
    fn test_request_to_anthropic() {
        let gemini = json!({
            "systemInstruction": {"parts": [{"text": "be terse"}]},
            "contents": [
                {"role": "user", "parts": [{"text": "hello"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "f", "args": {"x": 1}}}]}
            ],
            "generationConfig": {"maxOutputTokens": 512, "temperature": 0.9}
        });

        let out = request_to_anthropic(&gemini, "gemini-2.5-pro").unwrap();
        assert_eq!(out["model"], "gemini-2.5-pro");
        assert_eq!(out["system"], "be terse");
        assert_eq!(out["max_tokens"], 512);
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
    }

    #[test]
    fn test_response_round_trip() {
        let gemini = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "bonjour"}]},
                "finishReason": "MAX_TOKENS",
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2},
            "modelVersion": "gemini-2.5-pro"
        });

        let canonical = response_to_anthropic(&gemini).unwrap();
        assert_eq!(canonical["content"][0]["text"], "bonjour");
        assert_eq!(canonical["stop_reason"], "max_tokens");
        assert_eq!(canonical["usage"]["input_tokens"], 4);

        let back = response_from_anthropic(&canonical).unwrap();
        assert_eq!(back["candidates"][0]["content"]["parts"][0]["text"], "bonjour");
        assert_eq!(back["candidates"][0]["finishReason"], "MAX_TOKENS");
        assert_eq!(back["usageMetadata"]["promptTokenCount"], 4);
    }

    #[tokio::test]
    async fn test_bridge_maps_model_for_url() {
        let bridge = GeminiBridge::from_config(json!({})).unwrap();
        let out = bridge
            .transform_request(anthropic_request(), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(out["model"], "gemini-2.5-pro");
    }
}
