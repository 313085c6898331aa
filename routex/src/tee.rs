//! Tee fan-out: best-effort duplication of finalized records
//!
//! Each matching destination gets its own detached task, so deliveries ride
//! out client disconnects and never touch the user response. A delivery task
//! first waits for its record to be flushed to the store (avoiding double
//! counting by consumers that join on the log table), then attempts delivery
//! with capped, jittered exponential backoff.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::models::{RequestLog, TeeDestination, TeeKind};
use crate::store::Store;

/// Backoff base before the first retry
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Handler for `custom` destinations, registered by id
#[async_trait]
pub trait TeeHandler: Send + Sync {
    /// Deliver one record
    async fn deliver(&self, record: &RequestLog, preview: &Value) -> Result<()>;
}

/// Fan-out dispatcher
pub struct TeeDispatcher {
    client: reqwest::Client,
    metrics: Arc<Metrics>,
    file_locks: DashMap<String, Arc<Mutex<()>>>,
    handlers: DashMap<String, Arc<dyn TeeHandler>>,
}

impl TeeDispatcher {
    /// New dispatcher sharing the process metrics registry
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            client: reqwest::Client::new(),
            metrics,
            file_locks: DashMap::new(),
            handlers: DashMap::new(),
        }
    }

    /// Register a handler for `custom` destinations
    pub fn register_handler(&self, id: impl Into<String>, handler: Arc<dyn TeeHandler>) {
        self.handlers.insert(id.into(), handler);
    }

    /// Fan a finalized record out to every matching enabled destination
    ///
    /// `flush_seq` is the record's log-buffer sequence; delivery starts only
    /// after that sequence is durable. Fire-and-forget: errors are logged.
    pub fn dispatch(
        self: &Arc<Self>,
        store: Store,
        record: RequestLog,
        preview: Value,
        flush_seq: u64,
    ) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let destinations = match store.list_enabled_tees().await {
                Ok(destinations) => destinations,
                Err(e) => {
                    tracing::error!("tee destination listing failed: {}", e);
                    return;
                }
            };

            let matching: Vec<TeeDestination> = destinations
                .into_iter()
                .filter(|dest| dest.filter.matches(&record))
                .collect();
            if matching.is_empty() {
                return;
            }

            // Records are flushed before any sink sees them
            store.log_buffer().wait_flushed(flush_seq).await;

            for destination in matching {
                let dispatcher = dispatcher.clone();
                let record = record.clone();
                let preview = preview.clone();
                tokio::spawn(async move {
                    dispatcher.deliver_with_retry(&destination, &record, &preview).await;
                });
            }
        });
    }

    /// Attempt delivery up to `destination.retries` times
    async fn deliver_with_retry(
        &self,
        destination: &TeeDestination,
        record: &RequestLog,
        preview: &Value,
    ) {
        let attempts = destination.retries.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let timeout = Duration::from_secs(destination.timeout_secs.max(1));
            let result = tokio::time::timeout(
                timeout,
                self.deliver_once(destination, record, preview),
            )
            .await
            .unwrap_or(Err(Error::Timeout));

            match result {
                Ok(()) => {
                    tracing::debug!(
                        destination = %destination.name,
                        attempt = attempt + 1,
                        "tee record delivered"
                    );
                    self.metrics.record_tee(true);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        destination = %destination.name,
                        attempt = attempt + 1,
                        "tee delivery failed: {}",
                        e
                    );
                }
            }
        }

        tracing::warn!(
            destination = %destination.name,
            retries = attempts,
            "tee record dropped after retries"
        );
        self.metrics.record_tee(false);
    }

    async fn deliver_once(
        &self,
        destination: &TeeDestination,
        record: &RequestLog,
        preview: &Value,
    ) -> Result<()> {
        let payload = json!({
            "record": record,
            "response_preview": preview,
        });

        match destination.kind {
            TeeKind::Http | TeeKind::Webhook => {
                self.deliver_http(destination, &payload).await
            }
            TeeKind::File => self.deliver_file(destination, &payload).await,
            TeeKind::Custom => {
                let handler_id = destination.handler.as_deref().unwrap_or_default();
                let handler = self
                    .handlers
                    .get(handler_id)
                    .map(|entry| entry.clone())
                    .ok_or_else(|| {
                        Error::Internal(format!("no tee handler registered for '{}'", handler_id))
                    })?;
                handler.deliver(record, preview).await
            }
        }
    }

    async fn deliver_http(&self, destination: &TeeDestination, payload: &Value) -> Result<()> {
        let url = destination
            .url
            .as_deref()
            .ok_or_else(|| Error::Internal("http tee destination without url".to_string()))?;

        let method = match destination.method.as_deref() {
            Some("PUT") | Some("put") => reqwest::Method::PUT,
            _ => reqwest::Method::POST,
        };

        let mut request = self.client.request(method, url).json(payload);
        for (name, value) in &destination.headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::UpstreamError {
                status: 502,
                body: Some(e.to_string()),
            })?;

        if !response.status().is_success() {
            return Err(Error::UpstreamError {
                status: response.status().as_u16(),
                body: None,
            });
        }
        Ok(())
    }

    async fn deliver_file(&self, destination: &TeeDestination, payload: &Value) -> Result<()> {
        let path = destination
            .file_path
            .as_deref()
            .ok_or_else(|| Error::Internal("file tee destination without path".to_string()))?;

        let lock = self
            .file_locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut line = serde_json::to_vec(payload)
            .map_err(|e| Error::Internal(format!("tee payload serialization: {}", e)))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| Error::Internal(format!("open '{}': {}", path, e)))?;
        file.write_all(&line)
            .await
            .map_err(|e| Error::Internal(format!("append '{}': {}", path, e)))?;
        file.flush()
            .await
            .map_err(|e| Error::Internal(format!("flush '{}': {}", path, e)))?;
        Ok(())
    }
}

/// Exponential backoff with ±20% jitter: 500 ms, 1 s, 2 s, ...
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.as_millis() as u64 * 2_u64.pow(attempt.saturating_sub(1).min(10));
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((base as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record() -> RequestLog {
        RequestLog {
            id: "r-1".to_string(),
            channel_id: Some("ch-1".to_string()),
            model: "claude-opus-4".to_string(),
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            status_code: 200,
            latency_ms: 50,
            input_tokens: 10,
            output_tokens: 20,
            cached_tokens: 0,
            success: true,
            error: None,
            timestamp: Utc::now(),
            trace_id: None,
        }
    }

    fn file_destination(path: &str) -> TeeDestination {
        let now = Utc::now();
        TeeDestination {
            id: "t-1".to_string(),
            name: "file-sink".to_string(),
            kind: TeeKind::File,
            enabled: true,
            url: None,
            method: None,
            headers: StdHashMap::new(),
            file_path: Some(path.to_string()),
            handler: None,
            filter: Default::default(),
            retries: 3,
            timeout_secs: 5,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        // First retry ~500 ms, second ~1 s, both within jitter bounds
        let first = backoff_delay(1).as_millis() as f64;
        assert!((400.0..=600.0).contains(&first), "got {}", first);
        let second = backoff_delay(2).as_millis() as f64;
        assert!((800.0..=1200.0).contains(&second), "got {}", second);
    }

    #[tokio::test]
    async fn test_file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tee.jsonl");
        let destination = file_destination(path.to_str().unwrap());
        let dispatcher = TeeDispatcher::new(Arc::new(Metrics::new()));

        dispatcher
            .deliver_once(&destination, &record(), &json!({"ok": true}))
            .await
            .unwrap();
        dispatcher
            .deliver_once(&destination, &record(), &json!({"ok": true}))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["record"]["model"], "claude-opus-4");
        assert_eq!(parsed["response_preview"]["ok"], true);
    }

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl TeeHandler for CountingHandler {
        async fn deliver(&self, _record: &RequestLog, _preview: &Value) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(Error::Internal("transient".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let dispatcher = TeeDispatcher::new(Arc::new(Metrics::new()));
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        dispatcher.register_handler("counter", handler.clone());

        let now = Utc::now();
        let destination = TeeDestination {
            id: "t-2".to_string(),
            name: "custom-sink".to_string(),
            kind: TeeKind::Custom,
            enabled: true,
            url: None,
            method: None,
            headers: StdHashMap::new(),
            file_path: None,
            handler: Some("counter".to_string()),
            filter: Default::default(),
            retries: 3,
            timeout_secs: 5,
            created_at: now,
            updated_at: now,
        };

        // Fails twice, succeeds on the third (= last allowed) attempt
        dispatcher
            .deliver_with_retry(&destination, &record(), &json!({}))
            .await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.metrics.snapshot().tee_delivered, 1);
        assert_eq!(dispatcher.metrics.snapshot().tee_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_after_exhausted_retries() {
        let dispatcher = TeeDispatcher::new(Arc::new(Metrics::new()));
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        dispatcher.register_handler("counter", handler.clone());

        let now = Utc::now();
        let destination = TeeDestination {
            id: "t-3".to_string(),
            name: "failing-sink".to_string(),
            kind: TeeKind::Custom,
            enabled: true,
            url: None,
            method: None,
            headers: StdHashMap::new(),
            file_path: None,
            handler: Some("counter".to_string()),
            filter: Default::default(),
            retries: 2,
            timeout_secs: 5,
            created_at: now,
            updated_at: now,
        };

        dispatcher
            .deliver_with_retry(&destination, &record(), &json!({}))
            .await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.metrics.snapshot().tee_failed, 1);
    }

    #[tokio::test]
    async fn test_unknown_custom_handler_errors() {
        let dispatcher = TeeDispatcher::new(Arc::new(Metrics::new()));
        let now = Utc::now();
        let destination = TeeDestination {
            id: "t-4".to_string(),
            name: "ghost".to_string(),
            kind: TeeKind::Custom,
            enabled: true,
            url: None,
            method: None,
            headers: StdHashMap::new(),
            file_path: None,
            handler: Some("missing".to_string()),
            filter: Default::default(),
            retries: 1,
            timeout_secs: 5,
            created_at: now,
            updated_at: now,
        };
        assert!(dispatcher
            .deliver_once(&destination, &record(), &json!({}))
            .await
            .is_err());
    }
}
