//! SSE frame parsing and stream aggregation
//!
//! Frames are relayed to the client verbatim; this module only reads the
//! parallel in-memory copy after EOF to rebuild one logical message for
//! token accounting and the response-phase transformers.

use serde_json::{json, Value};

use crate::transform::dialect::{self, TokenUsage};

/// Extract the `data:` payloads from a raw SSE byte buffer
///
/// Handles multi-line frames and ignores comments, event names, and ids. The
/// `[DONE]` sentinel is skipped.
pub fn data_payloads(buffer: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut current = String::new();

    for line in buffer.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(rest);
        } else if line.is_empty() && !current.is_empty() {
            if current != "[DONE]" {
                payloads.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if !current.is_empty() && current != "[DONE]" {
        payloads.push(current);
    }
    payloads
}

/// Rebuild one canonical message from the accumulated stream copy
///
/// Understands Anthropic message events, OpenAI chat chunks, and Gemini
/// streaming candidates. Usage fields are merged with per-field maxima since
/// vendors repeat cumulative counts across frames.
pub fn aggregate(buffer: &str) -> Value {
    let mut model = Value::Null;
    let mut id = Value::Null;
    let mut text = String::new();
    let mut stop_reason = Value::Null;
    let mut usage = TokenUsage::default();

    for payload in data_payloads(buffer) {
        let Ok(frame) = serde_json::from_str::<Value>(&payload) else {
            continue;
        };

        usage = usage.merge_max(dialect::extract_usage(&frame));

        match frame.get("type").and_then(Value::as_str) {
            // Anthropic stream events
            Some("message_start") => {
                if let Some(message) = frame.get("message") {
                    id = message.get("id").cloned().unwrap_or(Value::Null);
                    model = message.get("model").cloned().unwrap_or(Value::Null);
                    usage = usage.merge_max(dialect::extract_usage(message));
                }
            }
            Some("content_block_delta") => {
                if let Some(delta) = frame
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                {
                    text.push_str(delta);
                }
            }
            Some("message_delta") => {
                if let Some(reason) = frame
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .filter(|r| !r.is_null())
                {
                    stop_reason = reason.clone();
                }
                if let Some(u) = frame.get("usage") {
                    usage = usage.merge_max(dialect::extract_usage(&json!({"usage": u})));
                }
            }
            _ => {
                // OpenAI chunks
                if let Some(choice) = frame
                    .get("choices")
                    .and_then(Value::as_array)
                    .and_then(|c| c.first())
                {
                    if id.is_null() {
                        id = frame.get("id").cloned().unwrap_or(Value::Null);
                        model = frame.get("model").cloned().unwrap_or(Value::Null);
                    }
                    if let Some(delta) = choice
                        .get("delta")
                        .and_then(|d| d.get("content"))
                        .and_then(Value::as_str)
                    {
                        text.push_str(delta);
                    }
                    if let Some(reason) = choice.get("finish_reason").filter(|r| !r.is_null()) {
                        if let Some(reason) = reason.as_str() {
                            stop_reason =
                                Value::String(dialect::finish_reason_to_anthropic(reason).to_string());
                        }
                    }
                }
                // Gemini chunks
                if let Some(candidate) = frame
                    .get("candidates")
                    .and_then(Value::as_array)
                    .and_then(|c| c.first())
                {
                    if model.is_null() {
                        model = frame.get("modelVersion").cloned().unwrap_or(Value::Null);
                    }
                    if let Some(parts) = candidate
                        .get("content")
                        .and_then(|c| c.get("parts"))
                        .and_then(Value::as_array)
                    {
                        for part in parts {
                            if let Some(t) = part.get("text").and_then(Value::as_str) {
                                text.push_str(t);
                            }
                        }
                    }
                    if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
                        stop_reason =
                            Value::String(dialect::gemini_finish_to_anthropic(reason).to_string());
                    }
                }
            }
        }
    }

    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": text}],
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": usage.input,
            "output_tokens": usage.output,
            "cache_read_input_tokens": usage.cached,
        }
    })
}
