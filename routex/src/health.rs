//! Channel health state machine
//!
//! Health state lives in memory and is authoritative for circuit-breaker and
//! rate-limit windows; counters are mirrored to the store after every
//! transition. Mutations for one channel are serialized through a per-entry
//! lock, and the lock is never held across an await: the new state is
//! computed synchronously, then persisted from a snapshot.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};

use crate::cache::AdaptiveCache;
use crate::config::ProxyConfig;
use crate::models::{Channel, ChannelStatus};
use crate::store::{ChannelRuntime, Store};

/// Outcome reported to the registry after an upstream attempt
#[derive(Debug, Clone, Copy)]
pub enum HealthEvent {
    /// Attempt succeeded
    Success,
    /// Attempt failed (transport error or retriable status)
    Failure,
    /// Upstream answered 429; cooldown honors Retry-After when present
    RateLimited {
        /// Parsed Retry-After, seconds
        retry_after_secs: Option<u64>,
    },
}

#[derive(Debug, Clone)]
struct HealthEntry {
    status: ChannelStatus,
    request_count: i64,
    success_count: i64,
    failure_count: i64,
    consecutive_failures: i64,
    last_used_at: Option<DateTime<Utc>>,
    last_failure_time: Option<DateTime<Utc>>,
    circuit_breaker_until: Option<DateTime<Utc>>,
    rate_limited_until: Option<DateTime<Utc>>,
    backoff_exponent: u32,
}

impl HealthEntry {
    fn from_channel(channel: &Channel) -> Self {
        Self {
            status: channel.status,
            request_count: channel.request_count,
            success_count: channel.success_count,
            failure_count: channel.failure_count,
            consecutive_failures: channel.consecutive_failures,
            last_used_at: channel.last_used_at,
            last_failure_time: channel.last_failure_time,
            circuit_breaker_until: channel.circuit_breaker_until,
            rate_limited_until: channel.rate_limited_until,
            backoff_exponent: 0,
        }
    }

    fn runtime(&self) -> ChannelRuntime {
        ChannelRuntime {
            status: self.status,
            request_count: self.request_count,
            success_count: self.success_count,
            failure_count: self.failure_count,
            consecutive_failures: self.consecutive_failures,
            last_used_at: self.last_used_at,
            last_failure_time: self.last_failure_time,
            circuit_breaker_until: self.circuit_breaker_until,
            rate_limited_until: self.rate_limited_until,
        }
    }

    /// Whether the circuit window has lapsed, making the next request a probe
    fn is_half_open(&self, now: DateTime<Utc>) -> bool {
        self.status == ChannelStatus::CircuitBreaker
            && self
                .circuit_breaker_until
                .map(|until| now >= until)
                .unwrap_or(true)
    }
}

/// Per-channel health registry
pub struct HealthRegistry {
    store: Store,
    cache: Arc<AdaptiveCache>,
    failure_threshold: i64,
    circuit_open_secs: i64,
    circuit_open_max_secs: i64,
    rate_limited_max_secs: u64,
    entries: DashMap<String, Arc<Mutex<HealthEntry>>>,
}

impl HealthRegistry {
    /// New registry reading thresholds from the proxy configuration
    pub fn new(store: Store, cache: Arc<AdaptiveCache>, config: &ProxyConfig) -> Self {
        Self {
            store,
            cache,
            failure_threshold: i64::from(config.failure_threshold),
            circuit_open_secs: config.circuit_open_secs as i64,
            circuit_open_max_secs: config.circuit_open_max_secs as i64,
            rate_limited_max_secs: config.rate_limited_max_secs,
            entries: DashMap::new(),
        }
    }

    /// Apply in-memory health state on top of a (possibly stale) cached row
    pub fn overlay(&self, channel: &Channel) -> Channel {
        let mut channel = channel.clone();
        if let Some(entry) = self.entries.get(&channel.id) {
            let entry = entry.lock().expect("health entry poisoned");
            // Admin disable always wins over runtime state
            if channel.status != ChannelStatus::Disabled {
                channel.status = entry.status;
            }
            channel.request_count = entry.request_count;
            channel.success_count = entry.success_count;
            channel.failure_count = entry.failure_count;
            channel.consecutive_failures = entry.consecutive_failures;
            channel.last_used_at = entry.last_used_at;
            channel.last_failure_time = entry.last_failure_time;
            channel.circuit_breaker_until = entry.circuit_breaker_until;
            channel.rate_limited_until = entry.rate_limited_until;
        }
        channel
    }

    /// Record that a channel was picked for an attempt
    pub async fn record_selection(&self, channel: &Channel) {
        let now = Utc::now();
        let entry = self.entry_for(channel);
        let snapshot = {
            let mut entry = entry.lock().expect("health entry poisoned");
            entry.request_count += 1;
            entry.last_used_at = Some(now);
            if entry.is_half_open(now) {
                tracing::debug!(channel = %channel.name, "circuit half-open, probing");
            }
            // Lapsed rate-limit windows close on the next selection
            if entry.status == ChannelStatus::RateLimited
                && entry
                    .rate_limited_until
                    .map(|until| now >= until)
                    .unwrap_or(true)
            {
                entry.status = ChannelStatus::Enabled;
                entry.rate_limited_until = None;
            }
            entry.runtime()
        };
        self.persist(&channel.id, &snapshot).await;
    }

    /// Record an attempt outcome and run the state machine
    pub async fn record_event(&self, channel: &Channel, event: HealthEvent) {
        let now = Utc::now();
        let entry = self.entry_for(channel);
        let snapshot = {
            let mut entry = entry.lock().expect("health entry poisoned");
            match event {
                HealthEvent::Success => self.apply_success(&mut entry),
                HealthEvent::Failure => self.apply_failure(&mut entry, now, &channel.name),
                HealthEvent::RateLimited { retry_after_secs } => {
                    self.apply_rate_limit(&mut entry, now, retry_after_secs, &channel.name)
                }
            }
            entry.runtime()
        };
        self.persist(&channel.id, &snapshot).await;
    }

    /// Current in-memory status for a channel id, when tracked
    pub fn status_of(&self, id: &str) -> Option<ChannelStatus> {
        self.entries
            .get(id)
            .map(|entry| entry.lock().expect("health entry poisoned").status)
    }

    fn apply_success(&self, entry: &mut HealthEntry) {
        entry.success_count += 1;
        entry.consecutive_failures = 0;
        entry.backoff_exponent = 0;
        entry.status = ChannelStatus::Enabled;
        entry.circuit_breaker_until = None;
        entry.rate_limited_until = None;
    }

    fn apply_failure(&self, entry: &mut HealthEntry, now: DateTime<Utc>, name: &str) {
        entry.failure_count += 1;
        entry.consecutive_failures += 1;
        entry.last_failure_time = Some(now);

        let was_half_open = entry.is_half_open(now);
        if was_half_open {
            // Failed probe: reopen with doubled window
            entry.backoff_exponent = entry.backoff_exponent.saturating_add(1);
            let window = self.circuit_window(entry.backoff_exponent);
            entry.status = ChannelStatus::CircuitBreaker;
            entry.circuit_breaker_until = Some(now + window);
            tracing::warn!(
                channel = name,
                window_secs = window.num_seconds(),
                "half-open probe failed, circuit reopened"
            );
        } else if entry.status != ChannelStatus::CircuitBreaker
            && entry.consecutive_failures >= self.failure_threshold
        {
            let window = self.circuit_window(entry.backoff_exponent);
            entry.status = ChannelStatus::CircuitBreaker;
            entry.circuit_breaker_until = Some(now + window);
            tracing::warn!(
                channel = name,
                consecutive_failures = entry.consecutive_failures,
                window_secs = window.num_seconds(),
                "circuit breaker opened"
            );
        }
    }

    fn apply_rate_limit(
        &self,
        entry: &mut HealthEntry,
        now: DateTime<Utc>,
        retry_after_secs: Option<u64>,
        name: &str,
    ) {
        entry.failure_count += 1;
        entry.consecutive_failures += 1;
        entry.last_failure_time = Some(now);

        let cooldown = retry_after_secs
            .unwrap_or(60)
            .min(self.rate_limited_max_secs);
        entry.status = ChannelStatus::RateLimited;
        entry.rate_limited_until = Some(now + ChronoDuration::seconds(cooldown as i64));
        tracing::warn!(
            channel = name,
            cooldown_secs = cooldown,
            "channel rate limited by upstream"
        );
    }

    fn circuit_window(&self, exponent: u32) -> ChronoDuration {
        let secs = self
            .circuit_open_secs
            .saturating_mul(1_i64 << exponent.min(20))
            .min(self.circuit_open_max_secs);
        ChronoDuration::seconds(secs)
    }

    fn entry_for(&self, channel: &Channel) -> Arc<Mutex<HealthEntry>> {
        self.entries
            .entry(channel.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(HealthEntry::from_channel(channel))))
            .clone()
    }

    async fn persist(&self, id: &str, runtime: &ChannelRuntime) {
        if let Err(e) = self.store.update_channel_runtime(id, runtime).await {
            tracing::error!(channel_id = id, "health mirror write failed: {}", e);
        }
        self.cache.invalidate_channel(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AdaptiveCache;
    use crate::config::CacheConfig;
    use crate::models::Vendor;
    use crate::store::NewChannel;

    async fn setup() -> (Store, Arc<HealthRegistry>, Channel) {
        let store = Store::connect_memory().await.unwrap();
        let cache = Arc::new(AdaptiveCache::new(CacheConfig::default()));
        let registry = Arc::new(HealthRegistry::new(
            store.clone(),
            cache,
            &ProxyConfig::default(),
        ));
        let channel = store
            .create_channel(NewChannel {
                name: "primary".to_string(),
                vendor: Vendor::Anthropic,
                base_url: None,
                api_key: None,
                refresh_token: None,
                models: Vec::new(),
                priority: 0,
                weight: 1,
                transformers: Vec::new(),
            })
            .await
            .unwrap();
        (store, registry, channel)
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let (store, registry, channel) = setup().await;

        for _ in 0..4 {
            registry.record_event(&channel, HealthEvent::Failure).await;
        }
        assert_eq!(
            registry.status_of(&channel.id),
            Some(ChannelStatus::Enabled),
            "four failures stay enabled"
        );

        registry.record_event(&channel, HealthEvent::Failure).await;
        assert_eq!(
            registry.status_of(&channel.id),
            Some(ChannelStatus::CircuitBreaker)
        );

        // Mirror reached the store
        let row = store.get_channel(&channel.id).await.unwrap();
        assert_eq!(row.status, ChannelStatus::CircuitBreaker);
        assert_eq!(row.consecutive_failures, 5);
        assert!(row.circuit_breaker_until.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_success_resets_counters_and_closes_circuit() {
        let (store, registry, channel) = setup().await;

        for _ in 0..5 {
            registry.record_event(&channel, HealthEvent::Failure).await;
        }
        registry.record_event(&channel, HealthEvent::Success).await;

        let row = store.get_channel(&channel.id).await.unwrap();
        assert_eq!(row.status, ChannelStatus::Enabled);
        assert_eq!(row.consecutive_failures, 0);
        assert!(row.circuit_breaker_until.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_honors_retry_after_with_cap() {
        let (_, registry, channel) = setup().await;

        registry
            .record_event(
                &channel,
                HealthEvent::RateLimited {
                    retry_after_secs: Some(10),
                },
            )
            .await;
        let entry = registry.entries.get(&channel.id).unwrap().clone();
        let until = entry
            .lock()
            .unwrap()
            .rate_limited_until
            .expect("cooldown set");
        let remaining = (until - Utc::now()).num_seconds();
        assert!((8..=10).contains(&remaining), "remaining {}", remaining);

        // A huge Retry-After clamps to the configured maximum (300 s)
        registry
            .record_event(
                &channel,
                HealthEvent::RateLimited {
                    retry_after_secs: Some(86_400),
                },
            )
            .await;
        let until = entry.lock().unwrap().rate_limited_until.unwrap();
        assert!((until - Utc::now()).num_seconds() <= 300);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_doubles_window() {
        let (_, registry, channel) = setup().await;
        let entry = {
            for _ in 0..5 {
                registry.record_event(&channel, HealthEvent::Failure).await;
            }
            registry.entries.get(&channel.id).unwrap().clone()
        };

        // Force the window into the past so the next failure is a failed probe
        {
            let mut entry = entry.lock().unwrap();
            entry.circuit_breaker_until = Some(Utc::now() - ChronoDuration::seconds(1));
        }
        registry.record_event(&channel, HealthEvent::Failure).await;

        let entry = entry.lock().unwrap();
        assert_eq!(entry.status, ChannelStatus::CircuitBreaker);
        assert_eq!(entry.backoff_exponent, 1);
        let window = (entry.circuit_breaker_until.unwrap() - Utc::now()).num_seconds();
        assert!((55..=60).contains(&window), "doubled window, got {}", window);
    }

    #[tokio::test]
    async fn test_overlay_replaces_runtime_fields() {
        let (store, registry, channel) = setup().await;
        registry.record_event(&channel, HealthEvent::Failure).await;

        let stale = store.get_channel(&channel.id).await.unwrap();
        let effective = registry.overlay(&stale);
        assert_eq!(effective.failure_count, 1);
        assert_eq!(effective.consecutive_failures, 1);
    }
}
