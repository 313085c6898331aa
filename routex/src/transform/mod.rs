//! Transformer pipeline
//!
//! Transformers are pre/post processors over JSON bodies in the canonical
//! Anthropic Messages shape. The pipeline applies enabled transformers in
//! ascending priority on the request path and descending priority on the
//! response path. Each application is bounded by the transform timeout.
//!
//! Failure policy: a request-phase failure (or a response-phase failure on a
//! buffered body) aborts the request. On a streaming response the frames are
//! already on the wire, so a response-phase failure is logged and the
//! aggregate passes through unchanged.

pub mod cleancache;
pub mod dialect;
pub mod gemini;
pub mod maxtoken;
pub mod openai;
pub mod sampling;

pub use cleancache::CleanCacheTransformer;
pub use gemini::GeminiBridge;
pub use maxtoken::MaxTokenTransformer;
pub use openai::OpenAiBridge;
pub use sampling::SamplingTransformer;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::RequestContext;

/// One request/response processor
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Stable id, unique within the pipeline
    fn id(&self) -> &str;

    /// Pipeline position; lower runs earlier on requests
    fn priority(&self) -> i64;

    /// Disabled transformers are skipped
    fn enabled(&self) -> bool;

    /// Rewrite an outbound request body
    async fn transform_request(&self, body: Value, ctx: &RequestContext) -> Result<Value>;

    /// Rewrite an inbound response body
    async fn transform_response(&self, body: Value, ctx: &RequestContext) -> Result<Value>;
}

/// Constructor taking the transformer's JSON settings
pub type Constructor = fn(Value) -> Result<Arc<dyn Transformer>>;

/// Registry mapping transformer ids to constructors
pub struct Registry {
    constructors: HashMap<&'static str, Constructor>,
}

impl Registry {
    /// Registry with every built-in transformer
    pub fn builtin() -> Self {
        let mut constructors: HashMap<&'static str, Constructor> = HashMap::new();
        constructors.insert("maxtoken", |cfg| {
            Ok(Arc::new(MaxTokenTransformer::from_config(cfg)?) as Arc<dyn Transformer>)
        });
        constructors.insert("sampling", |cfg| {
            Ok(Arc::new(SamplingTransformer::from_config(cfg)?) as Arc<dyn Transformer>)
        });
        constructors.insert("cleancache", |cfg| {
            Ok(Arc::new(CleanCacheTransformer::from_config(cfg)?) as Arc<dyn Transformer>)
        });
        constructors.insert("openai", |cfg| {
            Ok(Arc::new(OpenAiBridge::from_config(cfg)?) as Arc<dyn Transformer>)
        });
        constructors.insert("gemini", |cfg| {
            Ok(Arc::new(GeminiBridge::from_config(cfg)?) as Arc<dyn Transformer>)
        });
        Self { constructors }
    }

    /// Instantiate a transformer by id with the given settings
    pub fn build(&self, id: &str, settings: Value) -> Result<Arc<dyn Transformer>> {
        let constructor = self
            .constructors
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("transformer '{}'", id)))?;
        constructor(settings)
    }

    /// Known transformer ids
    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.constructors.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Admin view of one pipeline slot
#[derive(Debug, Clone, Serialize)]
pub struct TransformerInfo {
    /// Transformer id
    pub id: String,
    /// Pipeline position
    pub priority: i64,
    /// Whether the slot runs
    pub enabled: bool,
}

struct Slot {
    transformer: Arc<dyn Transformer>,
    settings: Value,
}

/// Ordered transformer pipeline
pub struct Pipeline {
    registry: Registry,
    timeout: Duration,
    slots: RwLock<Vec<Slot>>,
}

impl Pipeline {
    /// Empty pipeline with the built-in registry
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: Registry::builtin(),
            timeout,
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Instantiate and add a transformer; replaces an existing slot with the
    /// same id
    pub fn install(&self, id: &str, settings: Value) -> Result<TransformerInfo> {
        let transformer = self.registry.build(id, settings.clone())?;
        let info = TransformerInfo {
            id: transformer.id().to_string(),
            priority: transformer.priority(),
            enabled: transformer.enabled(),
        };

        let mut slots = self.slots.write().expect("pipeline lock poisoned");
        slots.retain(|slot| slot.transformer.id() != id);
        slots.push(Slot {
            transformer,
            settings,
        });
        slots.sort_by_key(|slot| slot.transformer.priority());
        Ok(info)
    }

    /// Remove a slot by id
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut slots = self.slots.write().expect("pipeline lock poisoned");
        let before = slots.len();
        slots.retain(|slot| slot.transformer.id() != id);
        if slots.len() == before {
            return Err(Error::NotFound(format!("transformer '{}'", id)));
        }
        Ok(())
    }

    /// Admin listing in request order
    pub fn list(&self) -> Vec<TransformerInfo> {
        self.slots
            .read()
            .expect("pipeline lock poisoned")
            .iter()
            .map(|slot| TransformerInfo {
                id: slot.transformer.id().to_string(),
                priority: slot.transformer.priority(),
                enabled: slot.transformer.enabled(),
            })
            .collect()
    }

    /// Stored settings for one slot
    pub fn settings(&self, id: &str) -> Option<Value> {
        self.slots
            .read()
            .expect("pipeline lock poisoned")
            .iter()
            .find(|slot| slot.transformer.id() == id)
            .map(|slot| slot.settings.clone())
    }

    /// Ids the registry can instantiate
    pub fn known_ids(&self) -> Vec<&'static str> {
        self.registry.ids()
    }

    /// Apply the request phase: enabled slots, ascending priority
    pub async fn apply_request(&self, body: Value, ctx: &RequestContext) -> Result<Value> {
        self.apply_request_with(body, ctx, &[]).await
    }

    /// Request phase with channel-scoped additions
    ///
    /// Slots named in `extra_ids` run even when globally disabled, merged
    /// into the same ascending-priority order.
    pub async fn apply_request_with(
        &self,
        mut body: Value,
        ctx: &RequestContext,
        extra_ids: &[String],
    ) -> Result<Value> {
        let transformers: Vec<Arc<dyn Transformer>> = {
            let slots = self.slots.read().expect("pipeline lock poisoned");
            slots
                .iter()
                .filter(|slot| {
                    slot.transformer.enabled()
                        || extra_ids.iter().any(|id| id == slot.transformer.id())
                })
                .map(|slot| slot.transformer.clone())
                .collect()
        };
        for transformer in transformers {
            body = self.run_one(&*transformer, body, ctx, Phase::Request).await?;
        }
        Ok(body)
    }

    /// Apply the response phase on a buffered body: descending priority
    pub async fn apply_response(&self, mut body: Value, ctx: &RequestContext) -> Result<Value> {
        let mut transformers = self.enabled_ascending();
        transformers.reverse();
        for transformer in transformers {
            body = self
                .run_one(&*transformer, body, ctx, Phase::Response)
                .await?;
        }
        Ok(body)
    }

    /// Apply the response phase on a streamed aggregate
    ///
    /// Frames are already delivered, so failures degrade to a warning and the
    /// unchanged value.
    pub async fn apply_response_streaming(&self, mut body: Value, ctx: &RequestContext) -> Value {
        let mut transformers = self.enabled_ascending();
        transformers.reverse();
        for transformer in transformers {
            match self
                .run_one(&*transformer, body.clone(), ctx, Phase::Response)
                .await
            {
                Ok(next) => body = next,
                Err(e) => {
                    tracing::warn!(
                        transformer = transformer.id(),
                        "response transform failed on streamed body, passing through: {}",
                        e
                    );
                }
            }
        }
        body
    }

    fn enabled_ascending(&self) -> Vec<Arc<dyn Transformer>> {
        self.slots
            .read()
            .expect("pipeline lock poisoned")
            .iter()
            .filter(|slot| slot.transformer.enabled())
            .map(|slot| slot.transformer.clone())
            .collect()
    }

    async fn run_one(
        &self,
        transformer: &dyn Transformer,
        body: Value,
        ctx: &RequestContext,
        phase: Phase,
    ) -> Result<Value> {
        let fut = async {
            match phase {
                Phase::Request => transformer.transform_request(body, ctx).await,
                Phase::Response => transformer.transform_response(body, ctx).await,
            }
        };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransformError {
                transformer: transformer.id().to_string(),
                message: format!("timed out after {:?}", self.timeout),
            }),
        }
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Request,
    Response,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Tag {
        id: String,
        priority: i64,
        enabled: bool,
        fail: bool,
    }

    #[async_trait]
    impl Transformer for Tag {
        fn id(&self) -> &str {
            &self.id
        }
        fn priority(&self) -> i64 {
            self.priority
        }
        fn enabled(&self) -> bool {
            self.enabled
        }
        async fn transform_request(&self, mut body: Value, _: &RequestContext) -> Result<Value> {
            if self.fail {
                return Err(Error::TransformError {
                    transformer: self.id.clone(),
                    message: "boom".to_string(),
                });
            }
            let trail = body["trail"].as_str().unwrap_or("").to_string();
            body["trail"] = Value::String(format!("{}{},", trail, self.id));
            Ok(body)
        }
        async fn transform_response(&self, mut body: Value, _: &RequestContext) -> Result<Value> {
            if self.fail {
                return Err(Error::TransformError {
                    transformer: self.id.clone(),
                    message: "boom".to_string(),
                });
            }
            let trail = body["trail"].as_str().unwrap_or("").to_string();
            body["trail"] = Value::String(format!("{}{},", trail, self.id));
            Ok(body)
        }
    }

    fn pipeline_with(tags: Vec<Tag>) -> Pipeline {
        let pipeline = Pipeline::new(Duration::from_secs(5));
        {
            let mut slots = pipeline.slots.write().unwrap();
            for tag in tags {
                slots.push(Slot {
                    transformer: Arc::new(tag),
                    settings: Value::Null,
                });
            }
            slots.sort_by_key(|s| s.transformer.priority());
        }
        pipeline
    }

    fn tag(id: &str, priority: i64) -> Tag {
        Tag {
            id: id.to_string(),
            priority,
            enabled: true,
            fail: false,
        }
    }

    #[tokio::test]
    async fn test_request_ascending_response_descending() {
        let pipeline = pipeline_with(vec![tag("b", 20), tag("a", 10)]);
        let ctx = RequestContext::default();

        let out = pipeline.apply_request(json!({}), &ctx).await.unwrap();
        assert_eq!(out["trail"], "a,b,");

        let out = pipeline.apply_response(json!({}), &ctx).await.unwrap();
        assert_eq!(out["trail"], "b,a,");
    }

    #[tokio::test]
    async fn test_disabled_slot_skipped() {
        let mut disabled = tag("off", 5);
        disabled.enabled = false;
        let pipeline = pipeline_with(vec![disabled, tag("on", 10)]);
        let out = pipeline
            .apply_request(json!({}), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(out["trail"], "on,");
    }

    #[tokio::test]
    async fn test_noop_pipeline_passes_body_through() {
        let pipeline = Pipeline::new(Duration::from_secs(5));
        let body = json!({"model": "claude-opus-4", "messages": [{"role": "user", "content": "hi"}]});
        let out = pipeline
            .apply_request(body.clone(), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(out, body);
        let out = pipeline
            .apply_response(body.clone(), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn test_request_failure_aborts() {
        let mut failing = tag("bad", 1);
        failing.fail = true;
        let pipeline = pipeline_with(vec![failing, tag("after", 2)]);
        let err = pipeline
            .apply_request(json!({}), &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransformError { .. }));
    }

    #[tokio::test]
    async fn test_streaming_failure_passes_through() {
        let mut failing = tag("bad", 1);
        failing.fail = true;
        let pipeline = pipeline_with(vec![failing]);
        let body = json!({"trail": "orig,"});
        let out = pipeline
            .apply_response_streaming(body.clone(), &RequestContext::default())
            .await;
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn test_install_and_remove_via_registry() {
        let pipeline = Pipeline::new(Duration::from_secs(5));
        pipeline
            .install("maxtoken", json!({"limit": 4096}))
            .unwrap();
        assert_eq!(pipeline.list().len(), 1);
        assert!(pipeline.install("unknown", json!({})).is_err());

        pipeline.remove("maxtoken").unwrap();
        assert!(pipeline.remove("maxtoken").is_err());
    }
}
