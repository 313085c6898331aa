//! Vendor dialect helpers shared by the bridges and the proxy
//!
//! The canonical in-gateway shape is the Anthropic Messages body. This module
//! carries dialect detection, the model-name synonym table, finish-reason
//! maps, and token-usage extraction across all three dialects.

use serde::Serialize;
use serde_json::Value;

/// Wire dialect of a chat/completion body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Anthropic Messages
    Anthropic,
    /// OpenAI Chat Completions
    OpenAi,
    /// Google Gemini generateContent
    Gemini,
}

/// Guess the dialect of a request body from its shape
pub fn detect(body: &Value) -> Dialect {
    if body.get("contents").is_some() {
        return Dialect::Gemini;
    }
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        // OpenAI merges system prompts into the message list and marks tool
        // results with a dedicated role; Anthropic keeps system top-level
        let openai_shaped = messages.iter().any(|m| {
            matches!(
                m.get("role").and_then(Value::as_str),
                Some("system") | Some("tool") | Some("developer")
            )
        }) || body.get("max_completion_tokens").is_some()
            || body.get("n").is_some()
            || body.get("frequency_penalty").is_some();
        if openai_shaped {
            return Dialect::OpenAi;
        }
    }
    Dialect::Anthropic
}

/// Known cross-vendor model synonyms
///
/// Maps a requested model name into the target dialect's nearest equivalent;
/// unknown names fall back to a vendor-neutral default per dialect.
const MODEL_SYNONYMS: &[(&str, Dialect, &str)] = &[
    ("claude-opus-4", Dialect::OpenAi, "gpt-4o"),
    ("claude-sonnet-4", Dialect::OpenAi, "gpt-4o-mini"),
    ("claude-haiku-3-5", Dialect::OpenAi, "gpt-4o-mini"),
    ("claude-opus-4", Dialect::Gemini, "gemini-2.5-pro"),
    ("claude-sonnet-4", Dialect::Gemini, "gemini-2.5-flash"),
    ("claude-haiku-3-5", Dialect::Gemini, "gemini-2.5-flash-lite"),
    ("gpt-4o", Dialect::Anthropic, "claude-opus-4"),
    ("gpt-4o-mini", Dialect::Anthropic, "claude-sonnet-4"),
    ("gemini-2.5-pro", Dialect::Anthropic, "claude-opus-4"),
    ("gemini-2.5-flash", Dialect::Anthropic, "claude-sonnet-4"),
];

/// Default model per dialect when no synonym is known
pub fn fallback_model(target: Dialect) -> &'static str {
    match target {
        Dialect::Anthropic => "claude-sonnet-4",
        Dialect::OpenAi => "gpt-4o-mini",
        Dialect::Gemini => "gemini-2.5-flash",
    }
}

/// Map a model name into the target dialect
///
/// Names already native to the target pass through; known synonyms map; the
/// rest take the dialect fallback.
pub fn map_model(model: &str, target: Dialect) -> String {
    let native = match target {
        Dialect::Anthropic => model.starts_with("claude-"),
        Dialect::OpenAi => model.starts_with("gpt-") || model.starts_with("o"),
        Dialect::Gemini => model.starts_with("gemini-"),
    };
    if native {
        return model.to_string();
    }
    MODEL_SYNONYMS
        .iter()
        .find(|(from, to, _)| *from == model && *to == target)
        .map(|(_, _, mapped)| (*mapped).to_string())
        .unwrap_or_else(|| fallback_model(target).to_string())
}

/// Anthropic stop_reason → OpenAI finish_reason
pub fn stop_reason_to_openai(stop_reason: &str) -> &'static str {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

/// OpenAI finish_reason → Anthropic stop_reason
pub fn finish_reason_to_anthropic(finish_reason: &str) -> &'static str {
    match finish_reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        "content_filter" => "end_turn",
        _ => "end_turn",
    }
}

/// Anthropic stop_reason → Gemini finishReason
pub fn stop_reason_to_gemini(stop_reason: &str) -> &'static str {
    match stop_reason {
        "end_turn" | "stop_sequence" | "tool_use" => "STOP",
        "max_tokens" => "MAX_TOKENS",
        _ => "OTHER",
    }
}

/// Gemini finishReason → Anthropic stop_reason
pub fn gemini_finish_to_anthropic(finish_reason: &str) -> &'static str {
    match finish_reason {
        "STOP" => "end_turn",
        "MAX_TOKENS" => "max_tokens",
        "SAFETY" | "RECITATION" | "BLOCKLIST" => "end_turn",
        _ => "end_turn",
    }
}

/// Token counts pulled out of a response body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    /// Input/prompt tokens
    pub input: i64,
    /// Output/completion tokens
    pub output: i64,
    /// Cache-read tokens
    pub cached: i64,
}

impl TokenUsage {
    /// Merge counts, keeping the per-field maximum
    ///
    /// SSE deltas repeat cumulative usage; the maximum is the final figure.
    pub fn merge_max(self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            input: self.input.max(other.input),
            output: self.output.max(other.output),
            cached: self.cached.max(other.cached),
        }
    }
}

/// Extract token usage from a response body of any supported dialect
pub fn extract_usage(body: &Value) -> TokenUsage {
    // Anthropic: { "usage": { "input_tokens", "output_tokens", "cache_read_input_tokens" } }
    if let Some(usage) = body.get("usage") {
        let input = usage
            .get("input_tokens")
            .or_else(|| usage.get("prompt_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let output = usage
            .get("output_tokens")
            .or_else(|| usage.get("completion_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let cached = usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_i64)
            .or_else(|| {
                usage
                    .get("prompt_tokens_details")
                    .and_then(|d| d.get("cached_tokens"))
                    .and_then(Value::as_i64)
            })
            .unwrap_or(0);
        if input > 0 || output > 0 || cached > 0 {
            return TokenUsage {
                input,
                output,
                cached,
            };
        }
    }

    // Gemini: { "usageMetadata": { "promptTokenCount", "candidatesTokenCount" } }
    if let Some(usage) = body.get("usageMetadata") {
        return TokenUsage {
            input: usage
                .get("promptTokenCount")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            output: usage
                .get("candidatesTokenCount")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            cached: usage
                .get("cachedContentTokenCount")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        };
    }

    TokenUsage::default()
}
