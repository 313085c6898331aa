//! In-memory read-through cache with adaptive TTLs
//!
//! Four cache classes front the store's hot reads. Each class owns an
//! independent TTL steered by a feedback controller: classes that miss too
//! often get longer TTLs, classes that overshoot the target hit rate give
//! freshness back, and access frequency nudges both directions. Concurrent
//! misses for one key collapse to a single backing load.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::models::{Channel, RoutingRule};
use crate::store::Store;

/// Cache class, one per hot read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// All channels
    Channels,
    /// Channels not admin-disabled
    EnabledChannels,
    /// One channel by id
    SingleChannel,
    /// Enabled routing rules in effective order
    RoutingRules,
}

impl CacheClass {
    const ALL: [CacheClass; 4] = [
        CacheClass::Channels,
        CacheClass::EnabledChannels,
        CacheClass::SingleChannel,
        CacheClass::RoutingRules,
    ];

    fn index(self) -> usize {
        match self {
            CacheClass::Channels => 0,
            CacheClass::EnabledChannels => 1,
            CacheClass::SingleChannel => 2,
            CacheClass::RoutingRules => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            CacheClass::Channels => "channels",
            CacheClass::EnabledChannels => "enabled_channels",
            CacheClass::SingleChannel => "single_channel",
            CacheClass::RoutingRules => "routing_rules",
        }
    }
}

#[derive(Clone)]
enum CachedValue {
    Channels(Arc<Vec<Channel>>),
    Channel(Arc<Channel>),
    Rules(Arc<Vec<RoutingRule>>),
}

struct Entry {
    value: CachedValue,
    expires_at: Instant,
}

/// Per-class counters; window counters reset each controller pass
struct ClassState {
    ttl_ms: AtomicU64,
    window_hits: AtomicU64,
    window_misses: AtomicU64,
    total_hits: AtomicU64,
    total_misses: AtomicU64,
}

impl ClassState {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: AtomicU64::new(ttl.as_millis() as u64),
            window_hits: AtomicU64::new(0),
            window_misses: AtomicU64::new(0),
            total_hits: AtomicU64::new(0),
            total_misses: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) {
        self.window_hits.fetch_add(1, Ordering::Relaxed);
        self.total_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.window_misses.fetch_add(1, Ordering::Relaxed);
        self.total_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }
}

/// Snapshot of one class for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ClassStats {
    /// Class name
    pub class: String,
    /// Cumulative hits
    pub hits: u64,
    /// Cumulative misses
    pub misses: u64,
    /// Cumulative hit rate
    pub hit_rate: f64,
    /// Current TTL in seconds
    pub ttl_secs: f64,
}

/// Read-through cache over the store
pub struct AdaptiveCache {
    config: CacheConfig,
    classes: [ClassState; 4],
    entries: DashMap<String, Entry>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl AdaptiveCache {
    /// New cache with every class at the configured default TTL
    pub fn new(config: CacheConfig) -> Self {
        let ttl = Duration::from_secs(config.ttl_default_secs);
        Self {
            config,
            classes: [
                ClassState::new(ttl),
                ClassState::new(ttl),
                ClassState::new(ttl),
                ClassState::new(ttl),
            ],
            entries: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    /// All channels, cached
    pub async fn channels(&self, store: &Store) -> Result<Arc<Vec<Channel>>> {
        let key = "channels";
        if let Some(value) = self.lookup(CacheClass::Channels, key) {
            if let CachedValue::Channels(channels) = value {
                return Ok(channels);
            }
        }
        let guard = self.inflight_guard(key);
        let _lock = guard.lock().await;
        // Another waiter may have populated the entry while we queued
        if let Some(CachedValue::Channels(channels)) = self.peek(key) {
            return Ok(channels);
        }
        let channels = Arc::new(store.list_channels().await?);
        self.insert(
            CacheClass::Channels,
            key.to_string(),
            CachedValue::Channels(channels.clone()),
        );
        Ok(channels)
    }

    /// Channels not admin-disabled, cached
    pub async fn enabled_channels(&self, store: &Store) -> Result<Arc<Vec<Channel>>> {
        let key = "enabled_channels";
        if let Some(CachedValue::Channels(channels)) = self.lookup(CacheClass::EnabledChannels, key)
        {
            return Ok(channels);
        }
        let guard = self.inflight_guard(key);
        let _lock = guard.lock().await;
        if let Some(CachedValue::Channels(channels)) = self.peek(key) {
            return Ok(channels);
        }
        let channels = Arc::new(store.list_enabled_channels().await?);
        self.insert(
            CacheClass::EnabledChannels,
            key.to_string(),
            CachedValue::Channels(channels.clone()),
        );
        Ok(channels)
    }

    /// One channel by id, cached
    pub async fn channel(&self, store: &Store, id: &str) -> Result<Arc<Channel>> {
        let key = format!("single_channel:{}", id);
        if let Some(CachedValue::Channel(channel)) = self.lookup(CacheClass::SingleChannel, &key) {
            return Ok(channel);
        }
        let guard = self.inflight_guard(&key);
        let _lock = guard.lock().await;
        if let Some(CachedValue::Channel(channel)) = self.peek(&key) {
            return Ok(channel);
        }
        let channel = Arc::new(store.get_channel(id).await?);
        self.insert(
            CacheClass::SingleChannel,
            key,
            CachedValue::Channel(channel.clone()),
        );
        Ok(channel)
    }

    /// Enabled routing rules in effective order, cached
    pub async fn enabled_rules(&self, store: &Store) -> Result<Arc<Vec<RoutingRule>>> {
        let key = "routing_rules";
        if let Some(CachedValue::Rules(rules)) = self.lookup(CacheClass::RoutingRules, key) {
            return Ok(rules);
        }
        let guard = self.inflight_guard(key);
        let _lock = guard.lock().await;
        if let Some(CachedValue::Rules(rules)) = self.peek(key) {
            return Ok(rules);
        }
        let rules = Arc::new(store.list_enabled_rules().await?);
        self.insert(
            CacheClass::RoutingRules,
            key.to_string(),
            CachedValue::Rules(rules.clone()),
        );
        Ok(rules)
    }

    /// Drop every channel-derived entry; call after any channel write
    pub fn invalidate_channels(&self) {
        self.entries.remove("channels");
        self.entries.remove("enabled_channels");
        self.entries
            .retain(|key, _| !key.starts_with("single_channel:"));
    }

    /// Drop one channel's entry plus the list entries its row feeds
    pub fn invalidate_channel(&self, id: &str) {
        self.entries.remove(&format!("single_channel:{}", id));
        self.entries.remove("channels");
        self.entries.remove("enabled_channels");
    }

    /// Drop the rule list; call after any rule write
    pub fn invalidate_rules(&self) {
        self.entries.remove("routing_rules");
    }

    /// Per-class stats snapshot
    pub fn stats(&self) -> Vec<ClassStats> {
        CacheClass::ALL
            .iter()
            .map(|class| {
                let state = &self.classes[class.index()];
                let hits = state.total_hits.load(Ordering::Relaxed);
                let misses = state.total_misses.load(Ordering::Relaxed);
                let total = hits + misses;
                ClassStats {
                    class: class.name().to_string(),
                    hits,
                    misses,
                    hit_rate: if total == 0 {
                        0.0
                    } else {
                        hits as f64 / total as f64
                    },
                    ttl_secs: state.ttl().as_secs_f64(),
                }
            })
            .collect()
    }

    /// Current TTL for a class
    pub fn ttl(&self, class: CacheClass) -> Duration {
        self.classes[class.index()].ttl()
    }

    /// Run one controller pass over every class
    ///
    /// `window` is the elapsed time the window counters cover.
    pub fn adjust_ttls(&self, window: Duration) {
        let min_ms = self.config.ttl_min_secs as f64 * 1000.0;
        let max_ms = self.config.ttl_max_secs as f64 * 1000.0;
        let target = self.config.target_hit_rate;
        let window_secs = window.as_secs_f64().max(f64::EPSILON);

        for class in CacheClass::ALL {
            let state = &self.classes[class.index()];
            let hits = state.window_hits.swap(0, Ordering::Relaxed);
            let misses = state.window_misses.swap(0, Ordering::Relaxed);
            let accesses = hits + misses;

            let mut ttl_ms = state.ttl_ms.load(Ordering::Relaxed) as f64;

            if accesses > 0 {
                let hit_rate = hits as f64 / accesses as f64;
                if hit_rate < target {
                    ttl_ms *= 1.2;
                } else if hit_rate > target + 0.10 {
                    ttl_ms *= 0.9;
                }
            }

            let freq = accesses as f64 / window_secs;
            if freq > 10.0 {
                ttl_ms *= 0.9;
            } else if freq < 0.1 {
                ttl_ms *= 1.2;
            }

            let clamped = ttl_ms.clamp(min_ms, max_ms);
            state.ttl_ms.store(clamped as u64, Ordering::Relaxed);

            if (clamped - ttl_ms).abs() > f64::EPSILON || accesses > 0 {
                tracing::trace!(
                    class = class.name(),
                    ttl_ms = clamped as u64,
                    hits,
                    misses,
                    "cache ttl adjusted"
                );
            }
        }
    }

    /// Start the periodic TTL controller
    pub fn spawn_controller(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.adjustment_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.adjust_ttls(interval);
            }
        });
    }

    fn lookup(&self, class: CacheClass, key: &str) -> Option<CachedValue> {
        let state = &self.classes[class.index()];

        // The shard guard must be released before any same-map mutation
        let (value, expired) = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => (Some(entry.value.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };

        if expired {
            self.entries.remove(key);
        }
        match &value {
            Some(_) => state.record_hit(),
            None => state.record_miss(),
        }
        value
    }

    /// Non-counting read used after winning the single-flight lock
    fn peek(&self, key: &str) -> Option<CachedValue> {
        self.entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    fn insert(&self, class: CacheClass, key: String, value: CachedValue) {
        let ttl = self.classes[class.index()].ttl();
        self.entries.insert(
            key.clone(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        self.inflight.remove(&key);
    }

    fn inflight_guard(&self, key: &str) -> Arc<Mutex<()>> {
        self.inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Vendor;
    use crate::store::NewChannel;

    fn test_config() -> CacheConfig {
        CacheConfig {
            ttl_min_secs: 5,
            ttl_max_secs: 300,
            ttl_default_secs: 60,
            target_hit_rate: 0.85,
            adjustment_interval_secs: 60,
        }
    }

    fn new_channel(name: &str) -> NewChannel {
        NewChannel {
            name: name.to_string(),
            vendor: Vendor::Anthropic,
            base_url: None,
            api_key: None,
            refresh_token: None,
            models: Vec::new(),
            priority: 0,
            weight: 1,
            transformers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_read_through_and_invalidation() {
        let store = Store::connect_memory().await.unwrap();
        let cache = AdaptiveCache::new(test_config());
        store.create_channel(new_channel("a")).await.unwrap();

        let first = cache.channels(&store).await.unwrap();
        assert_eq!(first.len(), 1);

        // Write behind the cache; stale until invalidated
        store.create_channel(new_channel("b")).await.unwrap();
        assert_eq!(cache.channels(&store).await.unwrap().len(), 1);

        cache.invalidate_channels();
        assert_eq!(cache.channels(&store).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_hit_miss_accounting() {
        let store = Store::connect_memory().await.unwrap();
        let cache = AdaptiveCache::new(test_config());

        cache.channels(&store).await.unwrap();
        cache.channels(&store).await.unwrap();
        cache.channels(&store).await.unwrap();

        let stats = cache.stats();
        let channels = stats.iter().find(|s| s.class == "channels").unwrap();
        assert_eq!(channels.misses, 1);
        assert_eq!(channels.hits, 2);
    }

    #[tokio::test]
    async fn test_single_flight_collapses_loads() {
        let store = Store::connect_memory().await.unwrap();
        store.create_channel(new_channel("a")).await.unwrap();
        let cache = Arc::new(AdaptiveCache::new(test_config()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { cache.channels(&store).await.unwrap() },
            ));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().len(), 1);
        }

        // All concurrent misses observe one populated entry; the class sees
        // at most a handful of misses (never one backing load per task)
        let stats = cache.stats();
        let channels = stats.iter().find(|s| s.class == "channels").unwrap();
        assert!(channels.misses <= 8);
        assert!(channels.hits + channels.misses == 8);
    }

    #[tokio::test]
    async fn test_ttl_grows_on_low_hit_rate() {
        let cache = AdaptiveCache::new(test_config());
        let state = &cache.classes[CacheClass::Channels.index()];

        // 1 hit, 9 misses in the window: hit rate 0.1 < 0.85
        state.window_hits.store(1, Ordering::Relaxed);
        state.window_misses.store(9, Ordering::Relaxed);
        cache.adjust_ttls(Duration::from_secs(60));

        let ttl = cache.ttl(CacheClass::Channels);
        assert!(ttl > Duration::from_secs(60), "ttl grew: {:?}", ttl);
    }

    #[tokio::test]
    async fn test_ttl_shrinks_on_high_hit_rate_and_hot_access() {
        let cache = AdaptiveCache::new(test_config());
        let state = &cache.classes[CacheClass::Channels.index()];

        // 1000 hits in 60 s: rate 1.0 > 0.95 and freq > 10/s, shrink twice
        state.window_hits.store(1000, Ordering::Relaxed);
        cache.adjust_ttls(Duration::from_secs(60));

        let ttl = cache.ttl(CacheClass::Channels);
        let expected = Duration::from_millis((60_000.0 * 0.9 * 0.9) as u64);
        assert_eq!(ttl, expected);
    }

    #[tokio::test]
    async fn test_ttl_clamped() {
        let mut config = test_config();
        config.ttl_default_secs = 6;
        let cache = AdaptiveCache::new(config);
        let state = &cache.classes[CacheClass::Channels.index()];

        // Repeated shrink pressure cannot push below the floor
        for _ in 0..20 {
            state.window_hits.store(10_000, Ordering::Relaxed);
            cache.adjust_ttls(Duration::from_secs(60));
        }
        assert_eq!(cache.ttl(CacheClass::Channels), Duration::from_secs(5));
    }
}
