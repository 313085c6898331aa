//! Fixed-window ingress rate limiting
//!
//! Counters live in a concurrent map keyed by client identity: the api-key
//! prefix when one is presented, otherwise the forwarded client IP. A
//! background sweep drops windows that have lapsed. On exceed the middleware
//! answers 429 with `X-RateLimit-*` and `Retry-After` headers.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Characters of the api key kept as the limiter key
const KEY_PREFIX_LEN: usize = 12;

/// Named limiter presets
pub fn preset(name: &str) -> (u32, Duration) {
    match name {
        "strict" => (10, Duration::from_secs(60)),
        "standard" => (100, Duration::from_secs(60)),
        "lenient" => (1000, Duration::from_secs(60)),
        "auth" => (5, Duration::from_secs(15 * 60)),
        // "proxy" and anything unrecognized
        _ => (60, Duration::from_secs(60)),
    }
}

#[derive(Debug)]
struct Window {
    start: Instant,
    count: u32,
}

/// Outcome of a limiter check
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    /// Window ceiling
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// Seconds until the window resets
    pub reset_secs: u64,
}

/// Fixed-window counter limiter
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    counters: DashMap<String, Window>,
}

impl RateLimiter {
    /// Limiter from configuration (overrides win over the preset)
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let (preset_max, preset_window) = preset(&config.preset);
        Self {
            max_requests: config.max_requests.unwrap_or(preset_max),
            window: config
                .window_ms
                .map(Duration::from_millis)
                .unwrap_or(preset_window),
            counters: DashMap::new(),
        }
    }

    /// Limiter with explicit parameters (tests)
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            counters: DashMap::new(),
        }
    }

    /// Count a hit for `key`; `Err` carries the Retry-After seconds
    pub fn check(&self, key: &str) -> std::result::Result<RateLimitDecision, u64> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Window {
                start: now,
                count: 0,
            });

        // Window rollover
        if now.duration_since(entry.start) >= self.window {
            entry.start = now;
            entry.count = 0;
        }

        let elapsed = now.duration_since(entry.start);
        let reset_secs = self.window.saturating_sub(elapsed).as_secs().max(1);

        if entry.count >= self.max_requests {
            return Err(reset_secs);
        }

        entry.count += 1;
        Ok(RateLimitDecision {
            limit: self.max_requests,
            remaining: self.max_requests - entry.count,
            reset_secs,
        })
    }

    /// Remove windows that lapsed more than one window ago
    pub fn sweep(&self) {
        let now = Instant::now();
        let horizon = self.window * 2;
        self.counters
            .retain(|_, window| now.duration_since(window.start) < horizon);
    }

    /// Start the periodic sweeper
    pub fn spawn_sweeper(self: Arc<Self>) {
        let period = self.window.max(Duration::from_secs(30));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep();
            }
        });
    }

    /// Tracked window count (admin status)
    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }
}

/// Shared state for the limiter middleware
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    enabled: bool,
}

impl RateLimitLayer {
    /// Build middleware state
    pub fn new(limiter: Arc<RateLimiter>, metrics: Arc<Metrics>, enabled: bool) -> Self {
        Self {
            limiter,
            metrics,
            enabled,
        }
    }

    /// Axum middleware entry point
    pub async fn middleware(
        State(layer): State<Self>,
        request: Request<Body>,
        next: Next,
    ) -> Result<Response> {
        if !layer.enabled {
            return Ok(next.run(request).await);
        }

        let key = client_key(&request);
        match layer.limiter.check(&key) {
            Ok(decision) => {
                let mut response = next.run(request).await;
                let headers = response.headers_mut();
                headers.insert("x-ratelimit-limit", header_value(decision.limit as u64));
                headers.insert(
                    "x-ratelimit-remaining",
                    header_value(decision.remaining as u64),
                );
                headers.insert("x-ratelimit-reset", header_value(decision.reset_secs));
                Ok(response)
            }
            Err(retry_after_secs) => {
                tracing::warn!(key = %key, "ingress rate limit exceeded");
                layer.metrics.record_rate_limited();
                let mut response = Error::RateLimited { retry_after_secs }.into_response();
                let headers = response.headers_mut();
                headers.insert(
                    "x-ratelimit-limit",
                    header_value(layer.limiter.max_requests as u64),
                );
                headers.insert("x-ratelimit-remaining", header_value(0));
                headers.insert("x-ratelimit-reset", header_value(retry_after_secs));
                headers.insert(header::RETRY_AFTER, header_value(retry_after_secs));
                Ok(response)
            }
        }
    }
}

/// Client identity: api-key prefix when present, else forwarded IP
fn client_key(request: &Request<Body>) -> String {
    if let Some(api_key) = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        let prefix: String = api_key.chars().take(KEY_PREFIX_LEN).collect();
        return format!("key:{}", prefix);
    }
    if let Some(auth) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
    {
        let prefix: String = auth.chars().take(KEY_PREFIX_LEN).collect();
        return format!("key:{}", prefix);
    }
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return format!("ip:{}", forwarded);
    }
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return format!("ip:{}", addr.ip());
    }
    "ip:unknown".to_string()
}

fn header_value(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or(HeaderValue::from_static("0"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_max_accepted_then_rejected() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for i in 0..3 {
            let decision = limiter.check("key:abc").unwrap();
            assert_eq!(decision.remaining, 2 - i);
        }
        // max + 1 rejected with Retry-After ≈ window
        let retry_after = limiter.check("key:abc").unwrap_err();
        assert!(retry_after <= 60 && retry_after >= 58, "got {}", retry_after);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("key:a").is_ok());
        assert!(limiter.check("key:b").is_ok());
        assert!(limiter.check("key:a").is_err());
    }

    #[test]
    fn test_presets() {
        assert_eq!(preset("strict").0, 10);
        assert_eq!(preset("standard").0, 100);
        assert_eq!(preset("lenient").0, 1000);
        assert_eq!(preset("proxy").0, 60);
        let (max, window) = preset("auth");
        assert_eq!(max, 5);
        assert_eq!(window, Duration::from_secs(900));
    }

    #[test]
    fn test_sweep_drops_stale_windows() {
        let limiter = RateLimiter::new(10, Duration::from_millis(0));
        limiter.check("key:a").ok();
        assert_eq!(limiter.tracked_keys(), 1);
        limiter.sweep();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_client_key_prefers_api_key() {
        let request = Request::builder()
            .header("x-api-key", "sk-ant-api03-verylongkey")
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_key(&request), "key:sk-ant-api03");

        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_key(&request), "ip:203.0.113.9");
    }
}
