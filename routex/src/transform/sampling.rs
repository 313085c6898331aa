//! Sampling-parameter transformer
//!
//! Clamps `temperature`, `top_p`, and `top_k` into configured ranges. With
//! `enforce_defaults` the configured default replaces whatever the caller
//! sent instead of clamping.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::Transformer;
use crate::error::{Error, Result};
use crate::models::RequestContext;

/// Inclusive float range with an optional enforced default
#[derive(Debug, Clone, Deserialize)]
pub struct FloatRange {
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
    /// Value used by `enforce_defaults`
    #[serde(default)]
    pub default: Option<f64>,
}

impl FloatRange {
    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// Settings for [`SamplingTransformer`]
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// Range for `temperature`
    #[serde(default = "default_temperature")]
    pub temperature: FloatRange,
    /// Range for `top_p`
    #[serde(default = "default_top_p")]
    pub top_p: FloatRange,
    /// Range for `top_k`
    #[serde(default = "default_top_k")]
    pub top_k: FloatRange,
    /// Replace values with defaults instead of clamping
    #[serde(default)]
    pub enforce_defaults: bool,
    /// Pipeline position
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Whether the slot runs
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_temperature() -> FloatRange {
    FloatRange {
        min: 0.0,
        max: 1.0,
        default: Some(1.0),
    }
}

fn default_top_p() -> FloatRange {
    FloatRange {
        min: 0.0,
        max: 1.0,
        default: None,
    }
}

fn default_top_k() -> FloatRange {
    FloatRange {
        min: 1.0,
        max: 500.0,
        default: None,
    }
}

fn default_priority() -> i64 {
    20
}

fn default_enabled() -> bool {
    true
}

/// Clamp sampling parameters into policy ranges
#[derive(Debug)]
pub struct SamplingTransformer {
    config: SamplingConfig,
}

impl SamplingTransformer {
    /// Build from JSON settings
    pub fn from_config(settings: Value) -> Result<Self> {
        let config: SamplingConfig = serde_json::from_value(settings)
            .map_err(|e| Error::Config(format!("sampling settings: {}", e)))?;
        Ok(Self { config })
    }

    fn apply_field(&self, body: &mut Value, field: &str, range: &FloatRange, integral: bool) {
        let Some(current) = body.get(field).and_then(Value::as_f64) else {
            return;
        };

        let next = if self.config.enforce_defaults {
            match range.default {
                Some(default) => default,
                None => range.clamp(current),
            }
        } else {
            range.clamp(current)
        };

        if (next - current).abs() > f64::EPSILON {
            tracing::debug!(field, from = current, to = next, "sampling parameter adjusted");
        }
        body[field] = if integral {
            Value::from(next as i64)
        } else {
            Value::from(next)
        };
    }
}

#[async_trait]
impl Transformer for SamplingTransformer {
    fn id(&self) -> &str {
        "sampling"
    }

    fn priority(&self) -> i64 {
        self.config.priority
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn transform_request(&self, mut body: Value, _ctx: &RequestContext) -> Result<Value> {
        self.apply_field(&mut body, "temperature", &self.config.temperature, false);
        self.apply_field(&mut body, "top_p", &self.config.top_p, false);
        self.apply_field(&mut body, "top_k", &self.config.top_k, true);
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

    #[tokio::test]
    async fn test_clamps_out_of_range() {
        let t = SamplingTransformer::from_config(json!({})).unwrap();
        let out = t
            .transform_request(
                json!({"temperature": 2.5, "top_p": -0.3, "top_k": 1000}),
                &RequestContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(out["temperature"], 1.0);
        assert_eq!(out["top_p"], 0.0);
        assert_eq!(out["top_k"], 500);
    }

    #[tokio::test]
    async fn test_in_range_untouched() {
        let t = SamplingTransformer::from_config(json!({})).unwrap();
        let out = t
            .transform_request(json!({"temperature": 0.7}), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(out["temperature"], 0.7);
    }

    #[tokio::test]
    async fn test_enforce_defaults_replaces() {
        let t = SamplingTransformer::from_config(json!({
            "temperature": {"min": 0.0, "max": 1.0, "default": 0.5},
            "enforce_defaults": true
        }))
        .unwrap();
        let out = t
            .transform_request(json!({"temperature": 0.9}), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(out["temperature"], 0.5);
    }

    #[tokio::test]
    async fn test_absent_fields_left_absent() {
        let t = SamplingTransformer::from_config(json!({})).unwrap();
        let out = t
            .transform_request(json!({"model": "claude-opus-4"}), &RequestContext::default())
            .await
            .unwrap();
        assert!(out.get("temperature").is_none());
    }
}
