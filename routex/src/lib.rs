//! # routex
//!
//! AI-API gateway: accepts chat/completion requests in the Anthropic, OpenAI,
//! or Gemini wire format, selects an outbound channel, rewrites between
//! vendor dialects, proxies the call (including SSE streaming), records the
//! outcome, and fans completed records out to tee sinks.
//!
//! ## Subsystems
//!
//! - **Crypto**: AEAD encryption of stored credentials, HMAC request signatures
//! - **Store**: SQLite rows for channels, rules, tee sinks, sessions, and
//!   batched request logs
//! - **Cache**: read-through cache with adaptive per-class TTLs and
//!   single-flight loads
//! - **Health**: per-channel circuit-breaker and rate-limit state machine
//! - **Balancer**: priority / round-robin / weighted / least-used selection
//! - **Routing**: priority-ordered rule overrides
//! - **Transform**: ordered pre/post pipeline plus vendor dialect bridges
//! - **Proxy**: outbound execution with retry/failover and SSE relay
//! - **Tee**: best-effort async fan-out with retry
//! - **Middleware**: panic recovery, request ids, rate limiting, signatures
//!
//! ## Example
//!
//! ```rust,no_run
//! use routex::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let state = AppState::build(config).await?;
//!     let app = routex::api::router(state.clone());
//!
//!     Server::new(state).serve(app).await
//! }
//! ```

pub mod api;
pub mod balancer;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod state;
pub mod store;
pub mod tee;
pub mod transform;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::balancer::LoadBalancer;
    pub use crate::cache::AdaptiveCache;
    pub use crate::config::Config;
    pub use crate::crypto::CredentialCipher;
    pub use crate::error::{Error, HotPathError, Result};
    pub use crate::health::{HealthEvent, HealthRegistry};
    pub use crate::metrics::{Metrics, TraceStore};
    pub use crate::middleware::{RateLimiter, SignatureLayer};
    pub use crate::models::{
        Channel, ChannelStatus, OAuthSession, RequestContext, RequestLog, RoutingRule,
        RuleCondition, Strategy, TeeDestination, TeeKind, Vendor,
    };
    pub use crate::observability::init_tracing;
    pub use crate::proxy::{ProxyEngine, ProxyReply};
    pub use crate::server::Server;
    pub use crate::state::AppState;
    pub use crate::store::Store;
    pub use crate::tee::TeeDispatcher;
    pub use crate::transform::{Pipeline, Transformer};

    pub use tracing::{debug, error, info, instrument, trace, warn};
}
