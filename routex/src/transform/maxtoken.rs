//! Token-cap transformer
//!
//! Clamps `max_tokens` into `[0, limit]`. Strict mode rejects instead of
//! clamping; either mode fills a default when the field is missing.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::Transformer;
use crate::error::{Error, Result};
use crate::models::RequestContext;

/// Settings for [`MaxTokenTransformer`]
#[derive(Debug, Clone, Deserialize)]
pub struct MaxTokenConfig {
    /// Ceiling applied to `max_tokens`
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Value filled in when the request omits `max_tokens`
    #[serde(default = "default_fill")]
    pub default_max_tokens: u32,
    /// Reject over-limit requests instead of clamping
    #[serde(default)]
    pub strict: bool,
    /// Pipeline position
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Whether the slot runs
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_limit() -> u32 {
    8192
}

fn default_fill() -> u32 {
    4096
}

fn default_priority() -> i64 {
    10
}

fn default_enabled() -> bool {
    true
}

/// Clamp or reject `max_tokens`
#[derive(Debug)]
pub struct MaxTokenTransformer {
    config: MaxTokenConfig,
}

impl MaxTokenTransformer {
    /// Build from JSON settings
    pub fn from_config(settings: Value) -> Result<Self> {
        let config: MaxTokenConfig = serde_json::from_value(settings)
            .map_err(|e| Error::Config(format!("maxtoken settings: {}", e)))?;
        Ok(Self { config })
    }
}

#[async_trait]
impl Transformer for MaxTokenTransformer {
    fn id(&self) -> &str {
        "maxtoken"
    }

    fn priority(&self) -> i64 {
        self.config.priority
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn transform_request(&self, mut body: Value, _ctx: &RequestContext) -> Result<Value> {
        let limit = self.config.limit;
        match body.get("max_tokens").and_then(Value::as_u64) {
            Some(requested) => {
                let requested = u32::try_from(requested).unwrap_or(u32::MAX);
                if requested > limit {
                    if self.config.strict {
                        return Err(Error::TokenLimitExceeded { requested, limit });
                    }
                    tracing::debug!(requested, limit, "max_tokens clamped");
                    body["max_tokens"] = Value::from(limit);
                }
            }
            None => {
                body["max_tokens"] = Value::from(self.config.default_max_tokens.min(limit));
            }
        }
        Ok(body)
    }

    async fn transform_response(&self, body: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transformer(limit: u32, strict: bool) -> MaxTokenTransformer {
        MaxTokenTransformer::from_config(json!({"limit": limit, "strict": strict})).unwrap()
    }

    #[tokio::test]
    async fn test_at_limit_passes_strict() {
        let t = transformer(1000, true);
        let out = t
            .transform_request(json!({"max_tokens": 1000}), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(out["max_tokens"], 1000);
    }

    #[tokio::test]
    async fn test_over_limit_fails_strict_clamps_lenient() {
        let strict = transformer(1000, true);
        let err = strict
            .transform_request(json!({"max_tokens": 1001}), &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TokenLimitExceeded {
                requested: 1001,
                limit: 1000
            }
        ));

        let lenient = transformer(1000, false);
        let out = lenient
            .transform_request(json!({"max_tokens": 1001}), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(out["max_tokens"], 1000);
    }

    #[tokio::test]
    async fn test_missing_field_filled() {
        let t = MaxTokenTransformer::from_config(
            json!({"limit": 8192, "default_max_tokens": 2048}),
        )
        .unwrap();
        let out = t
            .transform_request(json!({}), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(out["max_tokens"], 2048);
    }
}
