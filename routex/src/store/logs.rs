//! Request-log buffering, queries, and analytics
//!
//! `log_request` appends to an in-memory buffer and returns immediately. A
//! background flusher writes the buffer in one transaction every flush
//! interval, when the buffer fills, and at shutdown; at most one interval of
//! records is at risk on crash. Each enqueue is assigned a sequence number so
//! downstream consumers (tee fan-out) can wait until their record is durable.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};

use super::Store;
use crate::error::Result;
use crate::models::RequestLog;

/// Rows inserted per statement inside the flush transaction
const INSERT_CHUNK: usize = 50;

/// In-memory request-log buffer
pub struct LogBuffer {
    capacity: usize,
    interval: Duration,
    entries: Mutex<Vec<(u64, RequestLog)>>,
    next_seq: AtomicU64,
    full: Notify,
    flushed_tx: watch::Sender<u64>,
    flushed_rx: watch::Receiver<u64>,
}

impl LogBuffer {
    /// New buffer with the given capacity and flush interval
    pub fn new(capacity: usize, interval: Duration) -> Self {
        let (flushed_tx, flushed_rx) = watch::channel(0);
        Self {
            capacity: capacity.max(1),
            interval,
            entries: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(1),
            full: Notify::new(),
            flushed_tx,
            flushed_rx,
        }
    }

    /// Append a record; never blocks on I/O
    ///
    /// Returns the record's flush sequence number.
    pub fn enqueue(&self, record: RequestLog) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let len = {
            let mut entries = self.entries.lock().expect("log buffer poisoned");
            entries.push((seq, record));
            entries.len()
        };
        if len >= self.capacity {
            self.full.notify_one();
        }
        seq
    }

    /// Number of buffered, not-yet-flushed records
    pub fn pending(&self) -> usize {
        self.entries.lock().expect("log buffer poisoned").len()
    }

    /// Wait until the record with `seq` has been committed
    pub async fn wait_flushed(&self, seq: u64) {
        let mut rx = self.flushed_rx.clone();
        while *rx.borrow() < seq {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Start the background flusher
    pub fn spawn_flusher(self: Arc<Self>, store: Store) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.full.notified() => {}
                }
                if let Err(e) = self.flush_now(&store).await {
                    tracing::error!("request-log flush failed: {}", e);
                }
            }
        });
    }

    /// Drain the buffer and commit it in one transaction
    pub async fn flush_now(&self, store: &Store) -> Result<()> {
        let drained: Vec<(u64, RequestLog)> = {
            let mut entries = self.entries.lock().expect("log buffer poisoned");
            std::mem::take(&mut *entries)
        };
        if drained.is_empty() {
            return Ok(());
        }

        let high_seq = drained.iter().map(|(seq, _)| *seq).max().unwrap_or(0);
        let count = drained.len();

        let mut tx = store.pool.begin().await?;
        for chunk in drained.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO request_logs \
                 (id, channel_id, model, method, path, status_code, latency_ms, \
                  input_tokens, output_tokens, cached_tokens, success, error, \
                  timestamp, trace_id) ",
            );
            builder.push_values(chunk, |mut b, (_, rec)| {
                b.push_bind(&rec.id)
                    .push_bind(&rec.channel_id)
                    .push_bind(&rec.model)
                    .push_bind(&rec.method)
                    .push_bind(&rec.path)
                    .push_bind(rec.status_code)
                    .push_bind(rec.latency_ms)
                    .push_bind(rec.input_tokens)
                    .push_bind(rec.output_tokens)
                    .push_bind(rec.cached_tokens)
                    .push_bind(rec.success)
                    .push_bind(&rec.error)
                    .push_bind(rec.timestamp)
                    .push_bind(&rec.trace_id);
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        self.flushed_tx.send_replace(high_seq);
        tracing::debug!(records = count, "flushed request logs");
        Ok(())
    }
}

/// Filter for `requests_filtered`
#[derive(Debug, Clone, Default)]
pub struct RequestLogFilter {
    /// Exact status code
    pub status_code: Option<i64>,
    /// Exact channel id
    pub channel_id: Option<String>,
    /// Substring of the model name
    pub model: Option<String>,
    /// Substring of the path
    pub path: Option<String>,
    /// Inclusive lower bound on timestamp
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on timestamp
    pub until: Option<DateTime<Utc>>,
    /// Page size, default 50
    pub limit: Option<i64>,
    /// Page offset
    pub offset: Option<i64>,
}

/// One page of request logs plus the unpaged total
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogPage {
    /// Matching rows for this page, newest first
    pub requests: Vec<RequestLog>,
    /// Total matching rows ignoring limit/offset
    pub total: i64,
}

/// Aggregates over all request logs
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    /// Total requests logged
    pub total_requests: i64,
    /// Successful requests
    pub success_count: i64,
    /// Failed requests
    pub failure_count: i64,
    /// Mean latency in milliseconds
    pub avg_latency_ms: f64,
    /// Sum of input tokens
    pub input_tokens: i64,
    /// Sum of output tokens
    pub output_tokens: i64,
    /// Sum of cache-read tokens
    pub cached_tokens: i64,
    /// Cost derived from the pricing table
    pub cost_usd: f64,
    /// Per-model breakdown
    pub models: Vec<ModelUsage>,
}

/// Per-model usage row
#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    /// Model name
    pub model: String,
    /// Requests for this model
    pub requests: i64,
    /// Input tokens
    pub input_tokens: i64,
    /// Output tokens
    pub output_tokens: i64,
    /// Cost for this model from the pricing table
    pub cost_usd: f64,
}

#[derive(Debug, FromRow)]
struct LogRow {
    id: String,
    channel_id: Option<String>,
    model: String,
    method: String,
    path: String,
    status_code: i64,
    latency_ms: i64,
    input_tokens: i64,
    output_tokens: i64,
    cached_tokens: i64,
    success: bool,
    error: Option<String>,
    timestamp: DateTime<Utc>,
    trace_id: Option<String>,
}

impl From<LogRow> for RequestLog {
    fn from(row: LogRow) -> Self {
        RequestLog {
            id: row.id,
            channel_id: row.channel_id,
            model: row.model,
            method: row.method,
            path: row.path,
            status_code: row.status_code,
            latency_ms: row.latency_ms,
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
            cached_tokens: row.cached_tokens,
            success: row.success,
            error: row.error,
            timestamp: row.timestamp,
            trace_id: row.trace_id,
        }
    }
}

impl Store {
    /// Enqueue a finalized record; returns its flush sequence number
    pub fn log_request(&self, record: RequestLog) -> u64 {
        self.log_buffer.enqueue(record)
    }

    /// Page of request logs matching the filter, with the unpaged total
    pub async fn requests_filtered(&self, filter: &RequestLogFilter) -> Result<RequestLogPage> {
        let mut count_builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM request_logs");
        push_where(&mut count_builder, filter);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM request_logs");
        push_where(&mut builder, filter);
        builder.push(" ORDER BY timestamp DESC");
        builder.push(" LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(50).clamp(1, 1000));
        builder.push(" OFFSET ");
        builder.push_bind(filter.offset.unwrap_or(0).max(0));

        let rows: Vec<LogRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        Ok(RequestLogPage {
            requests: rows.into_iter().map(Into::into).collect(),
            total,
        })
    }

    /// Aggregates over all logs, costed with the pricing table
    pub async fn analytics(&self) -> Result<AnalyticsSummary> {
        #[derive(FromRow)]
        struct Totals {
            total_requests: i64,
            success_count: i64,
            avg_latency_ms: Option<f64>,
            input_tokens: Option<i64>,
            output_tokens: Option<i64>,
            cached_tokens: Option<i64>,
        }

        let totals: Totals = sqlx::query_as(
            r#"
            SELECT
                COUNT(*)                          AS total_requests,
                COALESCE(SUM(success), 0)         AS success_count,
                AVG(latency_ms)                   AS avg_latency_ms,
                SUM(input_tokens)                 AS input_tokens,
                SUM(output_tokens)                AS output_tokens,
                SUM(cached_tokens)                AS cached_tokens
            FROM request_logs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        #[derive(FromRow)]
        struct PerModel {
            model: String,
            requests: i64,
            input_tokens: Option<i64>,
            output_tokens: Option<i64>,
        }

        let per_model: Vec<PerModel> = sqlx::query_as(
            r#"
            SELECT
                model,
                COUNT(*)           AS requests,
                SUM(input_tokens)  AS input_tokens,
                SUM(output_tokens) AS output_tokens
            FROM request_logs
            GROUP BY model
            ORDER BY requests DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let models: Vec<ModelUsage> = per_model
            .into_iter()
            .map(|row| {
                let input = row.input_tokens.unwrap_or(0);
                let output = row.output_tokens.unwrap_or(0);
                ModelUsage {
                    cost_usd: self.pricing.cost(&row.model, input, output),
                    model: row.model,
                    requests: row.requests,
                    input_tokens: input,
                    output_tokens: output,
                }
            })
            .collect();

        let cost_usd = models.iter().map(|m| m.cost_usd).sum();

        Ok(AnalyticsSummary {
            total_requests: totals.total_requests,
            success_count: totals.success_count,
            failure_count: totals.total_requests - totals.success_count,
            avg_latency_ms: totals.avg_latency_ms.unwrap_or(0.0),
            input_tokens: totals.input_tokens.unwrap_or(0),
            output_tokens: totals.output_tokens.unwrap_or(0),
            cached_tokens: totals.cached_tokens.unwrap_or(0),
            cost_usd,
            models,
        })
    }
}

fn push_where(builder: &mut QueryBuilder<'_, Sqlite>, filter: &RequestLogFilter) {
    let mut first = true;
    let mut sep = |builder: &mut QueryBuilder<'_, Sqlite>| {
        builder.push(if std::mem::take(&mut first) {
            " WHERE "
        } else {
            " AND "
        });
    };

    if let Some(status) = filter.status_code {
        sep(builder);
        builder.push("status_code = ").push_bind(status);
    }
    if let Some(channel) = &filter.channel_id {
        sep(builder);
        builder.push("channel_id = ").push_bind(channel.clone());
    }
    if let Some(model) = &filter.model {
        sep(builder);
        builder
            .push("model LIKE ")
            .push_bind(format!("%{}%", model));
    }
    if let Some(path) = &filter.path {
        sep(builder);
        builder.push("path LIKE ").push_bind(format!("%{}%", path));
    }
    if let Some(since) = filter.since {
        sep(builder);
        builder.push("timestamp >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        sep(builder);
        builder.push("timestamp <= ").push_bind(until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: &str, status: i64, success: bool) -> RequestLog {
        RequestLog {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: Some("ch-1".to_string()),
            model: model.to_string(),
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            status_code: status,
            latency_ms: 100,
            input_tokens: 1000,
            output_tokens: 500,
            cached_tokens: 0,
            success,
            error: None,
            timestamp: Utc::now(),
            trace_id: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_flush_and_wait() {
        let store = Store::connect_memory().await.unwrap();
        let seq = store.log_request(record("claude-opus-4", 200, true));
        assert_eq!(store.log_buffer().pending(), 1);

        store.log_buffer().flush_now(&store).await.unwrap();
        assert_eq!(store.log_buffer().pending(), 0);

        // Already-flushed sequence resolves immediately
        store.log_buffer().wait_flushed(seq).await;

        let page = store
            .requests_filtered(&RequestLogFilter::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.requests[0].model, "claude-opus-4");
    }

    #[tokio::test]
    async fn test_filter_composition() {
        let store = Store::connect_memory().await.unwrap();
        store.log_request(record("claude-opus-4", 200, true));
        store.log_request(record("claude-sonnet-4", 200, true));
        store.log_request(record("gpt-4o", 502, false));
        store.log_buffer().flush_now(&store).await.unwrap();

        let page = store
            .requests_filtered(&RequestLogFilter {
                model: Some("claude".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);

        let page = store
            .requests_filtered(&RequestLogFilter {
                status_code: Some(502),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.requests[0].model, "gpt-4o");

        let page = store
            .requests_filtered(&RequestLogFilter {
                model: Some("claude".to_string()),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.requests.len(), 1);
        assert_eq!(page.total, 2, "total ignores paging");
    }

    #[tokio::test]
    async fn test_analytics_with_pricing() {
        let mut pricing = crate::config::PricingConfig::default();
        pricing.models.insert(
            "claude-opus-4".to_string(),
            crate::config::ModelPrice {
                input_per_mtok: 15.0,
                output_per_mtok: 75.0,
            },
        );

        let mut config = crate::config::DatabaseConfig::default();
        config.path = ":memory:".to_string();
        let cipher = crate::crypto::CredentialCipher::new(&"m".repeat(32), None).unwrap();
        let store = Store::connect(&config, cipher, pricing).await.unwrap();

        store.log_request(record("claude-opus-4", 200, true));
        store.log_request(record("claude-opus-4", 200, true));
        store.log_request(record("gpt-4o", 500, false));
        store.log_buffer().flush_now(&store).await.unwrap();

        let summary = store.analytics().await.unwrap();
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.input_tokens, 3000);
        assert_eq!(summary.output_tokens, 1500);

        // 2 opus requests: (2000 in * 15 + 1000 out * 75) / 1M
        let opus = summary
            .models
            .iter()
            .find(|m| m.model == "claude-opus-4")
            .unwrap();
        assert!((opus.cost_usd - (2000.0 * 15.0 + 1000.0 * 75.0) / 1_000_000.0).abs() < 1e-9);
    }
}
