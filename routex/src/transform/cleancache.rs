//! Cache-field stripping transformer
//!
//! Removes cache-control markers, request metadata, and internal debug
//! fields before the body leaves the gateway. Runs over the top level, the
//! system blocks, and every message content block.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::Transformer;
use crate::error::{Error, Result};
use crate::models::RequestContext;

/// Settings for [`CleanCacheTransformer`]
#[derive(Debug, Clone, Deserialize)]
pub struct CleanCacheConfig {
    /// Top-level fields removed from the request
    #[serde(default = "default_top_level")]
    pub strip_fields: Vec<String>,
    /// Whether `cache_control` is removed from content blocks
    #[serde(default = "default_enabled")]
    pub strip_cache_control: bool,
    /// Pipeline position
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Whether the slot runs
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_top_level() -> Vec<String> {
    vec!["metadata".to_string(), "_debug".to_string()]
}

fn default_priority() -> i64 {
    30
}

fn default_enabled() -> bool {
    true
}

/// Strip cache and metadata fields from request bodies
#[derive(Debug)]
pub struct CleanCacheTransformer {
    config: CleanCacheConfig,
}

impl CleanCacheTransformer {
    /// Build from JSON settings
    pub fn from_config(settings: Value) -> Result<Self> {
        let config: CleanCacheConfig = serde_json::from_value(settings)
            .map_err(|e| Error::Config(format!("cleancache settings: {}", e)))?;
        Ok(Self { config })
    }

    fn strip_blocks(&self, blocks: &mut Value) {
        let Some(items) = blocks.as_array_mut() else {
            return;
        };
        for item in items {
            if let Some(obj) = item.as_object_mut() {
                if self.config.strip_cache_control {
                    obj.remove("cache_control");
                }
            }
        }
    }
}

#[async_trait]
impl Transformer for CleanCacheTransformer {
    fn id(&self) -> &str {
        "cleancache"
    }

    fn priority(&self) -> i64 {
        self.config.priority
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn transform_request(&self, mut body: Value, _ctx: &RequestContext) -> Result<Value> {
        if let Some(obj) = body.as_object_mut() {
            for field in &self.config.strip_fields {
                obj.remove(field);
            }
        }

        if let Some(system) = body.get_mut("system") {
            self.strip_blocks(system);
        }
        if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
            for message in messages {
                if let Some(content) = message.get_mut("content") {
                    self.strip_blocks(content);
                }
            }
        }
        if let Some(tools) = body.get_mut("tools") {
            self.strip_blocks(tools);
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

    #[tokio::test]
    async fn test_strips_metadata_and_cache_control() {
        let t = CleanCacheTransformer::from_config(json!({})).unwrap();
        let body = json!({
            "model": "claude-opus-4",
            "metadata": {"user_id": "u-1"},
            "_debug": true,
            "system": [
                {"type": "text", "text": "be brief", "cache_control": {"type": "ephemeral"}}
            ],
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "hi", "cache_control": {"type": "ephemeral"}}
                ]}
            ]
        });

        let out = t
            .transform_request(body, &RequestContext::default())
            .await
            .unwrap();
        assert!(out.get("metadata").is_none());
        assert!(out.get("_debug").is_none());
        assert!(out["system"][0].get("cache_control").is_none());
        assert!(out["messages"][0]["content"][0].get("cache_control").is_none());
        // Everything else survives
        assert_eq!(out["messages"][0]["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_string_content_untouched() {
        let t = CleanCacheTransformer::from_config(json!({})).unwrap();
        let body = json!({
            "messages": [{"role": "user", "content": "plain string"}]
        });
        let out = t
            .transform_request(body.clone(), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn test_custom_strip_list() {
        let t = CleanCacheTransformer::from_config(json!({"strip_fields": ["internal_trace"]}))
            .unwrap();
        let out = t
            .transform_request(
                json!({"internal_trace": "x", "metadata": {"keep": true}}),
                &RequestContext::default(),
            )
            .await
            .unwrap();
        assert!(out.get("internal_trace").is_none());
        assert!(out.get("metadata").is_some());
    }
}
