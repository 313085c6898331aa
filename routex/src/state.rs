//! Application state: every subsystem, explicitly constructed and shared
//!
//! Nothing in the gateway is a global. `AppState::build` wires the store,
//! cache, health registry, balancer, pipeline, tee dispatcher, metrics, and
//! proxy engine in dependency order and starts their background tasks; tests
//! construct the same pieces with fakes where needed.

use serde_json::json;
use std::sync::Arc;

use crate::balancer::LoadBalancer;
use crate::cache::AdaptiveCache;
use crate::config::Config;
use crate::crypto::CredentialCipher;
use crate::error::Result;
use crate::health::HealthRegistry;
use crate::metrics::{Metrics, TraceStore};
use crate::middleware::{RateLimiter, SignatureLayer};
use crate::models::Strategy;
use crate::proxy::ProxyEngine;
use crate::store::Store;
use crate::tee::TeeDispatcher;
use crate::transform::Pipeline;

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<Config>,
    /// Persistent store
    pub store: Store,
    /// Read-through cache
    pub cache: Arc<AdaptiveCache>,
    /// Channel health registry
    pub health: Arc<HealthRegistry>,
    /// Load balancer
    pub balancer: Arc<LoadBalancer>,
    /// Transformer pipeline
    pub pipeline: Arc<Pipeline>,
    /// Tee dispatcher
    pub tee: Arc<TeeDispatcher>,
    /// Counter registry
    pub metrics: Arc<Metrics>,
    /// Trace ring buffer
    pub traces: Arc<TraceStore>,
    /// Proxy engine
    pub engine: Arc<ProxyEngine>,
    /// Ingress rate limiter
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Build the full state and start background tasks
    pub async fn build(config: Config) -> Result<Self> {
        let cipher = CredentialCipher::new(
            &config.crypto.master_password,
            config.crypto.encryption_salt.as_deref(),
        )?;

        let store = Store::connect(&config.database, cipher, config.pricing.clone()).await?;

        let cache = Arc::new(AdaptiveCache::new(config.cache.clone()));
        cache.clone().spawn_controller();

        let health = Arc::new(HealthRegistry::new(
            store.clone(),
            cache.clone(),
            &config.proxy,
        ));
        let balancer = Arc::new(LoadBalancer::new(Strategy::Priority));

        let pipeline = Arc::new(Pipeline::new(config.proxy.transform_timeout()));
        // Policy transformers run by default; dialect bridges are applied by
        // the engine per channel vendor and stay out of the default pipeline
        pipeline.install("maxtoken", json!({}))?;
        pipeline.install("sampling", json!({}))?;
        pipeline.install("cleancache", json!({}))?;

        let metrics = Arc::new(Metrics::new());
        let traces = Arc::new(TraceStore::new());
        let tee = Arc::new(TeeDispatcher::new(metrics.clone()));

        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        limiter.clone().spawn_sweeper();

        let engine = Arc::new(ProxyEngine::new(
            store.clone(),
            cache.clone(),
            health.clone(),
            balancer.clone(),
            pipeline.clone(),
            tee.clone(),
            metrics.clone(),
            traces.clone(),
            config.proxy.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            cache,
            health,
            balancer,
            pipeline,
            tee,
            metrics,
            traces,
            engine,
            limiter,
        })
    }

    /// Signature middleware state from the loaded configuration
    pub fn signature_layer(&self) -> SignatureLayer {
        SignatureLayer::new(self.config.signature.clone())
    }

    /// Flush buffers and close the store
    pub async fn shutdown(&self) {
        self.store.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.crypto.master_password = "state-test-master-password-000001".to_string();
        config.database.path = ":memory:".to_string();
        config
    }

    #[tokio::test]
    async fn test_build_wires_default_pipeline() {
        let state = AppState::build(test_config()).await.unwrap();
        let ids: Vec<String> = state.pipeline.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["maxtoken", "sampling", "cleancache"]);
        assert_eq!(state.balancer.strategy(), Strategy::Priority);
    }

    #[tokio::test]
    async fn test_build_rejects_weak_master_password() {
        let mut config = test_config();
        config.crypto.master_password = "short".to_string();
        assert!(AppState::build(config).await.is_err());
    }
}
