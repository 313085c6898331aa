//! Channel selection strategies
//!
//! The balancer owns only selection state (rotation counters, the PRNG); the
//! candidate set is supplied per call, already overlaid with in-memory
//! health. Selection is O(n) over candidates and tie-breaks are
//! deterministic: name order everywhere a counter or score ties.

use chrono::Utc;
use dashmap::DashMap;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{Channel, Strategy};

/// Process-wide load balancer
pub struct LoadBalancer {
    strategy: Mutex<Strategy>,
    priority_counters: DashMap<i64, AtomicUsize>,
    round_robin_counter: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl LoadBalancer {
    /// New balancer with the given starting strategy
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            priority_counters: DashMap::new(),
            round_robin_counter: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// New balancer with a fixed PRNG seed (tests)
    pub fn with_seed(strategy: Strategy, seed: u64) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            priority_counters: DashMap::new(),
            round_robin_counter: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Current strategy
    pub fn strategy(&self) -> Strategy {
        *self.strategy.lock().expect("strategy lock poisoned")
    }

    /// Replace the strategy (admin API)
    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.lock().expect("strategy lock poisoned") = strategy;
        tracing::info!(%strategy, "load balancing strategy changed");
    }

    /// Pick a channel for `model` from the given pool
    ///
    /// The pool is narrowed to channels that are selectable now, support the
    /// model, and are not in `exclude` (channels already failed during this
    /// request). Fails with `NoChannelAvailable` when nothing remains.
    pub fn select(&self, pool: &[Channel], model: &str, exclude: &[String]) -> Result<Channel> {
        let now = Utc::now();
        let mut candidates: Vec<&Channel> = pool
            .iter()
            .filter(|ch| ch.is_selectable(now))
            .filter(|ch| ch.supports_model(model))
            .filter(|ch| !exclude.contains(&ch.id))
            .collect();

        if candidates.is_empty() {
            return Err(Error::NoChannelAvailable {
                model: model.to_string(),
            });
        }

        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        let chosen = match self.strategy() {
            Strategy::Priority => self.pick_priority(&candidates),
            Strategy::RoundRobin => self.pick_round_robin(&candidates),
            Strategy::Weighted => self.pick_weighted(&candidates),
            Strategy::LeastUsed => self.pick_least_used(&candidates),
        };

        Ok(chosen.clone())
    }

    /// Highest priority wins; equal priorities rotate via a per-band counter
    fn pick_priority<'a>(&self, candidates: &[&'a Channel]) -> &'a Channel {
        let top = candidates
            .iter()
            .map(|ch| ch.priority)
            .max()
            .expect("candidates non-empty");
        let band: Vec<&'a Channel> = candidates
            .iter()
            .copied()
            .filter(|ch| ch.priority == top)
            .collect();

        let counter = self
            .priority_counters
            .entry(top)
            .or_insert_with(|| AtomicUsize::new(0));
        let index = counter.fetch_add(1, Ordering::Relaxed) % band.len();
        band[index]
    }

    /// Rotating global index over the name-sorted candidates
    fn pick_round_robin<'a>(&self, candidates: &[&'a Channel]) -> &'a Channel {
        let index = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[index]
    }

    /// Random pick with P(i) = weight_i / Σweight
    fn pick_weighted<'a>(&self, candidates: &[&'a Channel]) -> &'a Channel {
        let total: i64 = candidates.iter().map(|ch| ch.weight.max(1)).sum();
        let mut roll = self
            .rng
            .lock()
            .expect("rng lock poisoned")
            .random_range(0..total);
        for channel in candidates.iter().copied() {
            roll -= channel.weight.max(1);
            if roll < 0 {
                return channel;
            }
        }
        candidates[candidates.len() - 1]
    }

    /// Fewest requests; ties go to the higher priority, then name order
    fn pick_least_used<'a>(&self, candidates: &[&'a Channel]) -> &'a Channel {
        candidates
            .iter()
            .copied()
            .min_by(|a, b| {
                a.request_count
                    .cmp(&b.request_count)
                    .then(b.priority.cmp(&a.priority))
                    .then(a.name.cmp(&b.name))
            })
            .expect("candidates non-empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelStatus, Vendor};
    use chrono::Duration;
    use std::collections::HashMap;

    fn channel(name: &str, priority: i64, weight: i64) -> Channel {
        let now = Utc::now();
        Channel {
            id: format!("id-{}", name),
            name: name.to_string(),
            vendor: Vendor::Anthropic,
            base_url: None,
            api_key: None,
            refresh_token: None,
            models: Vec::new(),
            priority,
            weight,
            status: ChannelStatus::Enabled,
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_used_at: None,
            last_failure_time: None,
            circuit_breaker_until: None,
            rate_limited_until: None,
            created_at: now,
            updated_at: now,
            transformers: Vec::new(),
        }
    }

    #[test]
    fn test_priority_picks_highest_then_falls_back() {
        let lb = LoadBalancer::new(Strategy::Priority);
        let mut a = channel("a", 10, 1);
        let b = channel("b", 5, 1);
        let mut c = channel("c", 1, 1);
        c.status = ChannelStatus::Disabled;

        let pool = vec![a.clone(), b.clone(), c.clone()];
        assert_eq!(lb.select(&pool, "m", &[]).unwrap().name, "a");

        // Disable the leader, next band wins
        a.status = ChannelStatus::Disabled;
        let pool = vec![a.clone(), b.clone(), c.clone()];
        assert_eq!(lb.select(&pool, "m", &[]).unwrap().name, "b");

        // Nothing selectable
        let pool = vec![a, c];
        assert!(matches!(
            lb.select(&pool, "m", &[]),
            Err(Error::NoChannelAvailable { .. })
        ));
    }

    #[test]
    fn test_priority_round_robins_within_band() {
        let lb = LoadBalancer::new(Strategy::Priority);
        let pool = vec![channel("a", 10, 1), channel("b", 10, 1), channel("c", 5, 1)];

        let picks: Vec<String> = (0..4)
            .map(|_| lb.select(&pool, "m", &[]).unwrap().name)
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_round_robin_rotates_name_order() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let pool = vec![channel("b", 1, 1), channel("a", 9, 1), channel("c", 5, 1)];

        let picks: Vec<String> = (0..4)
            .map(|_| lb.select(&pool, "m", &[]).unwrap().name)
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_weighted_respects_weights() {
        let lb = LoadBalancer::with_seed(Strategy::Weighted, 42);
        let pool = vec![channel("heavy", 0, 9), channel("light", 0, 1)];

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..1000 {
            *counts
                .entry(lb.select(&pool, "m", &[]).unwrap().name)
                .or_default() += 1;
        }
        let heavy = counts.get("heavy").copied().unwrap_or(0);
        assert!(heavy > 800, "heavy picked {} / 1000", heavy);
        assert!(heavy < 1000, "light never starves entirely");
    }

    #[test]
    fn test_least_used_with_tie_breaks() {
        let lb = LoadBalancer::new(Strategy::LeastUsed);
        let mut a = channel("a", 1, 1);
        let mut b = channel("b", 9, 1);
        let mut c = channel("c", 9, 1);
        a.request_count = 5;
        b.request_count = 2;
        c.request_count = 2;

        // b and c tie on count and priority; name breaks the tie
        assert_eq!(lb.select(&[a, b, c], "m", &[]).unwrap().name, "b");
    }

    #[test]
    fn test_model_filter_and_empty_models() {
        let lb = LoadBalancer::new(Strategy::Priority);
        let mut opus = channel("opus-only", 1, 1);
        opus.models = vec!["claude-opus-4".to_string()];
        let any = channel("any", 0, 1);

        let pool = vec![opus, any];
        assert_eq!(
            lb.select(&pool, "claude-opus-4", &[]).unwrap().name,
            "opus-only"
        );
        // Channels with an empty model list accept anything
        assert_eq!(lb.select(&pool, "gpt-4o", &[]).unwrap().name, "any");
    }

    #[test]
    fn test_exclusion_for_retry() {
        let lb = LoadBalancer::new(Strategy::Priority);
        let pool = vec![channel("a", 10, 1), channel("b", 5, 1)];

        let excluded = vec!["id-a".to_string()];
        assert_eq!(lb.select(&pool, "m", &excluded).unwrap().name, "b");
    }

    #[test]
    fn test_expired_circuit_window_is_eligible() {
        let lb = LoadBalancer::new(Strategy::Priority);
        let mut a = channel("a", 10, 1);
        a.status = ChannelStatus::CircuitBreaker;
        a.circuit_breaker_until = Some(Utc::now() - Duration::seconds(1));

        assert_eq!(lb.select(&[a.clone()], "m", &[]).unwrap().name, "a");

        a.circuit_breaker_until = Some(Utc::now() + Duration::seconds(30));
        assert!(lb.select(&[a], "m", &[]).is_err());
    }
}
