//! In-process counters and trace capture
//!
//! The gateway exposes counters and spans, not views: `/api/metrics` reads
//! the counter registry, `/api/tracing/*` reads a bounded ring of recent
//! request traces recorded by the proxy engine. Everything here is
//! process-local and cheap enough for the hot path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Default trace ring capacity
const TRACE_CAPACITY: usize = 256;

/// Counter registry
pub struct Metrics {
    started_at: Instant,
    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_failed: AtomicU64,
    requests_cancelled: AtomicU64,
    retries_total: AtomicU64,
    rate_limited_total: AtomicU64,
    streams_total: AtomicU64,
    tee_delivered: AtomicU64,
    tee_failed: AtomicU64,
}

impl Metrics {
    /// New registry; uptime starts now
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_cancelled: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            streams_total: AtomicU64::new(0),
            tee_delivered: AtomicU64::new(0),
            tee_failed: AtomicU64::new(0),
        }
    }

    /// Seconds since construction
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Count one finished request
    pub fn record_request(&self, success: bool, cancelled: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if cancelled {
            self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
        } else if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one retried attempt
    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one ingress rate-limit rejection
    pub fn record_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one SSE stream
    pub fn record_stream(&self) {
        self.streams_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one tee delivery outcome
    pub fn record_tee(&self, delivered: bool) {
        if delivered {
            self.tee_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tee_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Zero every counter (uptime is preserved)
    pub fn reset(&self) {
        self.requests_total.store(0, Ordering::Relaxed);
        self.requests_success.store(0, Ordering::Relaxed);
        self.requests_failed.store(0, Ordering::Relaxed);
        self.requests_cancelled.store(0, Ordering::Relaxed);
        self.retries_total.store(0, Ordering::Relaxed);
        self.rate_limited_total.store(0, Ordering::Relaxed);
        self.streams_total.store(0, Ordering::Relaxed);
        self.tee_delivered.store(0, Ordering::Relaxed);
        self.tee_failed.store(0, Ordering::Relaxed);
    }

    /// Point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),
            streams_total: self.streams_total.load(Ordering::Relaxed),
            tee_delivered: self.tee_delivered.load(Ordering::Relaxed),
            tee_failed: self.tee_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable counter snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Seconds since process start
    pub uptime_secs: u64,
    /// Requests finished
    pub requests_total: u64,
    /// Requests succeeded
    pub requests_success: u64,
    /// Requests failed
    pub requests_failed: u64,
    /// Requests cancelled by the client
    pub requests_cancelled: u64,
    /// Channel retries performed
    pub retries_total: u64,
    /// Ingress requests rejected by the rate limiter
    pub rate_limited_total: u64,
    /// SSE streams served
    pub streams_total: u64,
    /// Tee records delivered
    pub tee_delivered: u64,
    /// Tee records dropped after retries
    pub tee_failed: u64,
}

/// One timed step inside a request trace
#[derive(Debug, Clone, Serialize)]
pub struct TraceSpan {
    /// Step name (select, transform_request, upstream, ...)
    pub name: String,
    /// Step duration in milliseconds
    pub duration_ms: u64,
    /// Free-form attribute, e.g. the selected channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One recorded request trace
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    /// Trace id (shared with the request log row)
    pub id: String,
    /// Request id from ingress
    pub request_id: String,
    /// Ingress path
    pub path: String,
    /// Final model
    pub model: String,
    /// Serving channel name, when one was reached
    pub channel: Option<String>,
    /// Final status code
    pub status: u16,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Ordered steps
    pub spans: Vec<TraceSpan>,
}

/// Summary row for trace listings
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    /// Trace id
    pub id: String,
    /// Ingress path
    pub path: String,
    /// Final model
    pub model: String,
    /// Final status code
    pub status: u16,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
}

/// Stats for the tracing endpoints
#[derive(Debug, Clone, Serialize)]
pub struct TraceStats {
    /// Traces currently retained
    pub retained: usize,
    /// Ring capacity
    pub capacity: usize,
    /// Total traces recorded since start/clear
    pub recorded: u64,
}

/// Bounded ring of recent traces
pub struct TraceStore {
    capacity: usize,
    recorded: AtomicU64,
    ring: Mutex<VecDeque<Trace>>,
}

impl TraceStore {
    /// Ring with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(TRACE_CAPACITY)
    }

    /// Ring with an explicit capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recorded: AtomicU64::new(0),
            ring: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Record a finished trace, evicting the oldest at capacity
    pub fn record(&self, trace: Trace) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        let mut ring = self.ring.lock().expect("trace ring poisoned");
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(trace);
    }

    /// Ring stats
    pub fn stats(&self) -> TraceStats {
        let ring = self.ring.lock().expect("trace ring poisoned");
        TraceStats {
            retained: ring.len(),
            capacity: self.capacity,
            recorded: self.recorded.load(Ordering::Relaxed),
        }
    }

    /// Newest-first summaries
    pub fn summaries(&self) -> Vec<TraceSummary> {
        self.ring
            .lock()
            .expect("trace ring poisoned")
            .iter()
            .rev()
            .map(|trace| TraceSummary {
                id: trace.id.clone(),
                path: trace.path.clone(),
                model: trace.model.clone(),
                status: trace.status,
                started_at: trace.started_at,
                duration_ms: trace.duration_ms,
            })
            .collect()
    }

    /// Full trace by id
    pub fn get(&self, id: &str) -> Option<Trace> {
        self.ring
            .lock()
            .expect("trace ring poisoned")
            .iter()
            .find(|trace| trace.id == id)
            .cloned()
    }

    /// Drop everything
    pub fn clear(&self) {
        self.ring.lock().expect("trace ring poisoned").clear();
        self.recorded.store(0, Ordering::Relaxed);
    }
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(id: &str) -> Trace {
        Trace {
            id: id.to_string(),
            request_id: format!("req-{}", id),
            path: "/v1/messages".to_string(),
            model: "claude-opus-4".to_string(),
            channel: Some("primary".to_string()),
            status: 200,
            started_at: Utc::now(),
            duration_ms: 120,
            spans: vec![TraceSpan {
                name: "upstream".to_string(),
                duration_ms: 100,
                detail: None,
            }],
        }
    }

    #[test]
    fn test_counters_and_reset() {
        let metrics = Metrics::new();
        metrics.record_request(true, false);
        metrics.record_request(false, false);
        metrics.record_request(false, true);
        metrics.record_retry();
        metrics.record_stream();

        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 3);
        assert_eq!(snap.requests_success, 1);
        assert_eq!(snap.requests_failed, 1);
        assert_eq!(snap.requests_cancelled, 1);
        assert_eq!(snap.retries_total, 1);
        assert_eq!(snap.streams_total, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot().requests_total, 0);
    }

    #[test]
    fn test_trace_ring_eviction() {
        let store = TraceStore::with_capacity(2);
        store.record(trace("a"));
        store.record(trace("b"));
        store.record(trace("c"));

        let stats = store.stats();
        assert_eq!(stats.retained, 2);
        assert_eq!(stats.recorded, 3);

        assert!(store.get("a").is_none(), "oldest evicted");
        assert!(store.get("c").is_some());

        // Newest first
        let ids: Vec<String> = store.summaries().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["c".to_string(), "b".to_string()]);

        store.clear();
        assert_eq!(store.stats().retained, 0);
    }
}
