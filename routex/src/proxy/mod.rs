//! Proxy engine: channel selection, outbound execution, retry/failover
//!
//! One `handle` call serves one inbound request end to end: routing rules,
//! channel selection, request transforms, the vendor call (streamed or
//! buffered), health/counter updates, the request-log record, tee fan-out,
//! and a trace for the ring buffer. Failed channels are excluded from the
//! candidate set for the remainder of the request.

pub mod sse;
pub mod upstream;

use axum::body::Body;
use axum::http::StatusCode;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::balancer::LoadBalancer;
use crate::cache::AdaptiveCache;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::health::{HealthEvent, HealthRegistry};
use crate::metrics::{Metrics, Trace, TraceSpan, TraceStore};
use crate::models::{Channel, RequestContext, RequestLog, Vendor};
use crate::routing::{self, RouteTarget};
use crate::store::Store;
use crate::tee::TeeDispatcher;
use crate::transform::dialect::{self, Dialect, TokenUsage};
use crate::transform::{gemini, openai, Pipeline};

/// Client-closed-request status used for cancellation records
const STATUS_CLIENT_CLOSED: u16 = 499;

/// What the engine hands back to the ingress layer
pub enum ProxyReply {
    /// Buffered JSON response in the canonical Anthropic shape
    Json {
        /// Upstream status
        status: StatusCode,
        /// Canonical response body
        body: Value,
    },
    /// SSE stream relayed from the upstream
    Stream {
        /// Body forwarding upstream frames verbatim
        body: Body,
    },
}

/// The request-serving engine
pub struct ProxyEngine {
    store: Store,
    cache: Arc<AdaptiveCache>,
    health: Arc<HealthRegistry>,
    balancer: Arc<LoadBalancer>,
    pipeline: Arc<Pipeline>,
    tee: Arc<TeeDispatcher>,
    metrics: Arc<Metrics>,
    traces: Arc<TraceStore>,
    client: reqwest::Client,
    config: ProxyConfig,
}

impl ProxyEngine {
    /// Wire the engine; dependencies are constructed by the caller
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        cache: Arc<AdaptiveCache>,
        health: Arc<HealthRegistry>,
        balancer: Arc<LoadBalancer>,
        pipeline: Arc<Pipeline>,
        tee: Arc<TeeDispatcher>,
        metrics: Arc<Metrics>,
        traces: Arc<TraceStore>,
        config: ProxyConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            store,
            cache,
            health,
            balancer,
            pipeline,
            tee,
            metrics,
            traces,
            client,
            config,
        }
    }

    /// Serve one inbound request
    pub async fn handle(&self, mut ctx: RequestContext, mut body: Value) -> Result<ProxyReply> {
        let started = Instant::now();
        let started_at = Utc::now();
        let trace_id = Uuid::new_v4().to_string();
        let mut spans: Vec<TraceSpan> = Vec::new();

        // Routing rules run before any channel is considered
        let route_started = Instant::now();
        let rules = self.cache.enabled_rules(&self.store).await?;
        let decision = routing::evaluate(&rules, &ctx);
        if let Some(decision) = &decision {
            if let Some(model) = &decision.model {
                ctx.model = model.clone();
                body["model"] = Value::String(model.clone());
            }
        }
        spans.push(TraceSpan {
            name: "route".to_string(),
            duration_ms: route_started.elapsed().as_millis() as u64,
            detail: decision.as_ref().map(|d| d.rule.clone()),
        });

        // If the handler future is dropped before finalize runs, this guard
        // writes the 499 record for the delivered portion
        let mut cancel_guard = CancelGuard::new(
            self.store.clone(),
            self.metrics.clone(),
            &ctx,
            trace_id.clone(),
            started,
        );

        let pinned = matches!(
            decision.as_ref().map(|d| &d.target),
            Some(RouteTarget::Named(_))
        );
        let mut excluded: Vec<String> = Vec::new();
        let mut last_error: Option<Error> = None;

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                self.metrics.record_retry();
            }

            let select_started = Instant::now();
            let channel = match self.select_channel(&decision, &ctx, &excluded).await {
                Ok(channel) => channel,
                Err(e) => {
                    // Nothing (left) to try; surface the most specific error
                    let err = last_error.take().unwrap_or(e);
                    self.finalize_failure(&ctx, None, &err, started, started_at, &trace_id, spans);
                    cancel_guard.defuse();
                    return Err(err);
                }
            };
            spans.push(TraceSpan {
                name: "select".to_string(),
                duration_ms: select_started.elapsed().as_millis() as u64,
                detail: Some(channel.name.clone()),
            });
            self.health.record_selection(&channel).await;
            cancel_guard.set_channel(&channel);

            let transform_started = Instant::now();
            let transformed = match self
                .pipeline
                .apply_request_with(body.clone(), &ctx, &channel.transformers)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    self.finalize_failure(
                        &ctx,
                        Some(&channel),
                        &e,
                        started,
                        started_at,
                        &trace_id,
                        spans,
                    );
                    cancel_guard.defuse();
                    return Err(e);
                }
            };
            let (outbound, mapped_model) = convert_for_vendor(transformed, channel.vendor);
            spans.push(TraceSpan {
                name: "transform_request".to_string(),
                duration_ms: transform_started.elapsed().as_millis() as u64,
                detail: None,
            });

            let upstream_started = Instant::now();
            let attempt_result = self
                .attempt_upstream(&channel, &ctx, &outbound, &mapped_model)
                .await;
            spans.push(TraceSpan {
                name: "upstream".to_string(),
                duration_ms: upstream_started.elapsed().as_millis() as u64,
                detail: Some(format!("attempt {}", attempt + 1)),
            });

            match attempt_result {
                AttemptResult::Stream(response) => {
                    self.health.record_event(&channel, HealthEvent::Success).await;
                    self.metrics.record_stream();
                    cancel_guard.defuse();
                    return Ok(self.relay_stream(
                        response, channel, ctx, started, started_at, trace_id, spans,
                    ));
                }
                AttemptResult::Json { status, body } => {
                    self.health.record_event(&channel, HealthEvent::Success).await;
                    let canonical = match self
                        .canonicalize_response(body, channel.vendor, &ctx)
                        .await
                    {
                        Ok(canonical) => canonical,
                        Err(e) => {
                            self.finalize_failure(
                                &ctx,
                                Some(&channel),
                                &e,
                                started,
                                started_at,
                                &trace_id,
                                spans,
                            );
                            cancel_guard.defuse();
                            return Err(e);
                        }
                    };
                    let usage = dialect::extract_usage(&canonical);
                    self.finalize(FinalizeArgs {
                        ctx: &ctx,
                        channel: Some(&channel),
                        status: status.as_u16(),
                        usage,
                        success: true,
                        cancelled: false,
                        error: None,
                        started,
                        started_at,
                        trace_id: &trace_id,
                        spans,
                        preview: canonical.clone(),
                    });
                    cancel_guard.defuse();
                    return Ok(ProxyReply::Json {
                        status,
                        body: canonical,
                    });
                }
                AttemptResult::Terminal(err) => {
                    self.finalize_failure(
                        &ctx,
                        Some(&channel),
                        &err,
                        started,
                        started_at,
                        &trace_id,
                        spans,
                    );
                    cancel_guard.defuse();
                    return Err(err);
                }
                AttemptResult::Retriable(err) => {
                    let event = match &err {
                        Error::UpstreamError { status: 429, .. } => HealthEvent::RateLimited {
                            retry_after_secs: retry_after_from_error(&err),
                        },
                        _ => HealthEvent::Failure,
                    };
                    self.health.record_event(&channel, event).await;
                    tracing::warn!(
                        channel = %channel.name,
                        attempt = attempt + 1,
                        "upstream attempt failed: {}",
                        err
                    );
                    excluded.push(channel.id.clone());
                    last_error = Some(err);
                    if pinned {
                        // A pinned route has no alternate channel to fail over to
                        break;
                    }
                }
            }
        }

        let err = last_error.unwrap_or(Error::NoChannelAvailable {
            model: ctx.model.clone(),
        });
        self.finalize_failure(&ctx, None, &err, started, started_at, &trace_id, spans);
        cancel_guard.defuse();
        Err(err)
    }

    /// Minimal upstream probe for the channel-test admin endpoints
    pub async fn probe(&self, channel: &Channel) -> Result<u64> {
        let model = channel
            .models
            .first()
            .cloned()
            .unwrap_or_else(|| dialect::fallback_model(vendor_dialect(channel.vendor)).to_string());
        let body = json!({
            "model": model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });
        let (outbound, mapped_model) = convert_for_vendor(body, channel.vendor);

        let started = Instant::now();
        let url = upstream::build_url(channel, &mapped_model, false)?;
        let headers = upstream::build_headers(channel)?;
        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&outbound)
            .timeout(self.config.upstream_timeout())
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if status.is_success() {
            self.health.record_event(channel, HealthEvent::Success).await;
            Ok(started.elapsed().as_millis() as u64)
        } else {
            self.health.record_event(channel, HealthEvent::Failure).await;
            Err(Error::UpstreamError {
                status: status.as_u16(),
                body: response.text().await.ok(),
            })
        }
    }

    async fn select_channel(
        &self,
        decision: &Option<routing::RouteDecision>,
        ctx: &RequestContext,
        excluded: &[String],
    ) -> Result<Channel> {
        match decision.as_ref().map(|d| &d.target) {
            Some(RouteTarget::Named(name)) => {
                let channel = self
                    .store
                    .get_channel_by_name(name)
                    .await
                    .map_err(|_| Error::RoutedChannelUnavailable {
                        channel: name.clone(),
                    })?;
                let channel = self.health.overlay(&channel);
                let eligible = channel.is_selectable(Utc::now())
                    && channel.supports_model(&ctx.model)
                    && !excluded.contains(&channel.id);
                if !eligible {
                    // A routed channel never falls back silently
                    return Err(Error::RoutedChannelUnavailable {
                        channel: name.clone(),
                    });
                }
                Ok(channel)
            }
            _ => {
                let pool = self.cache.enabled_channels(&self.store).await?;
                let pool: Vec<Channel> = pool.iter().map(|ch| self.health.overlay(ch)).collect();
                self.balancer.select(&pool, &ctx.model, excluded)
            }
        }
    }

    async fn attempt_upstream(
        &self,
        channel: &Channel,
        ctx: &RequestContext,
        outbound: &Value,
        mapped_model: &str,
    ) -> AttemptResult {
        let url = match upstream::build_url(channel, mapped_model, ctx.stream) {
            Ok(url) => url,
            Err(e) => return AttemptResult::Terminal(e),
        };
        let headers = match upstream::build_headers(channel) {
            Ok(headers) => headers,
            Err(e) => return AttemptResult::Terminal(e),
        };

        let mut request = self.client.post(&url).headers(headers).json(outbound);
        // Streams get no overall deadline; chunk pacing is the client's call
        if !ctx.stream {
            request = request.timeout(self.config.upstream_timeout());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return AttemptResult::Retriable(classify_send_error(&e)),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = parse_retry_after(&response);
            return AttemptResult::Retriable(Error::UpstreamError {
                status: 429,
                body: retry_after.map(|s| s.to_string()),
            });
        }
        if status.as_u16() == 408 {
            let body = response.text().await.ok();
            return AttemptResult::Retriable(Error::UpstreamError { status: 408, body });
        }
        if status.is_server_error() {
            let body = response.text().await.ok();
            return AttemptResult::Retriable(Error::UpstreamError {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = response.text().await.ok();
            return AttemptResult::Terminal(Error::UpstreamError {
                status: status.as_u16(),
                body,
            });
        }

        let is_sse = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_sse && ctx.stream {
            return AttemptResult::Stream(response);
        }

        match response.bytes().await {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(body) => AttemptResult::Json { status, body },
                Err(e) => AttemptResult::Retriable(Error::UpstreamError {
                    status: 502,
                    body: Some(format!("upstream body is not JSON: {}", e)),
                }),
            },
            Err(e) => AttemptResult::Retriable(classify_send_error(&e)),
        }
    }

    /// Vendor response → canonical Anthropic shape, then response transforms
    async fn canonicalize_response(
        &self,
        body: Value,
        vendor: Vendor,
        ctx: &RequestContext,
    ) -> Result<Value> {
        let canonical = match vendor_dialect(vendor) {
            Dialect::Anthropic => body,
            Dialect::OpenAi => openai::response_to_anthropic(&body)?,
            Dialect::Gemini => gemini::response_to_anthropic(&body)?,
        };
        self.pipeline.apply_response(canonical, ctx).await
    }

    /// Forward frames to the client while accumulating a bounded copy
    #[allow(clippy::too_many_arguments)]
    fn relay_stream(
        &self,
        response: reqwest::Response,
        channel: Channel,
        ctx: RequestContext,
        started: Instant,
        started_at: chrono::DateTime<Utc>,
        trace_id: String,
        spans: Vec<TraceSpan>,
    ) -> ProxyReply {
        let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(32);
        let cap = self.config.stream_buffer_cap_bytes;

        let store = self.store.clone();
        let pipeline = self.pipeline.clone();
        let tee = self.tee.clone();
        let metrics = self.metrics.clone();
        let traces = self.traces.clone();

        tokio::spawn(async move {
            let mut upstream = response.bytes_stream();
            let mut copy: Vec<u8> = Vec::new();
            let mut truncated = false;
            let mut client_gone = false;
            let mut upstream_failed = false;

            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if copy.len() + bytes.len() <= cap {
                            copy.extend_from_slice(&bytes);
                        } else if !truncated {
                            truncated = true;
                            tracing::warn!(
                                cap_bytes = cap,
                                "stream copy truncated; token accounting may undercount"
                            );
                        }
                        if tx.send(Ok(bytes)).await.is_err() {
                            // Client went away: drop the upstream promptly
                            client_gone = true;
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("upstream stream error after headers: {}", e);
                        upstream_failed = true;
                        break;
                    }
                }
            }
            drop(tx);

            // Frames are on the wire; the aggregate exists for accounting and
            // response-phase transforms only
            let aggregate = sse::aggregate(&String::from_utf8_lossy(&copy));
            let aggregate = pipeline.apply_response_streaming(aggregate, &ctx).await;
            let usage = dialect::extract_usage(&aggregate);

            let (status, success) = if client_gone {
                (STATUS_CLIENT_CLOSED, false)
            } else if upstream_failed {
                (StatusCode::BAD_GATEWAY.as_u16(), false)
            } else {
                (StatusCode::OK.as_u16(), true)
            };

            let latency_ms = started.elapsed().as_millis() as i64;
            let record = RequestLog {
                id: Uuid::new_v4().to_string(),
                channel_id: Some(channel.id.clone()),
                model: ctx.model.clone(),
                method: ctx.method.clone(),
                path: ctx.path.clone(),
                status_code: i64::from(status),
                latency_ms,
                input_tokens: usage.input,
                output_tokens: usage.output,
                cached_tokens: usage.cached,
                success,
                error: match (client_gone, upstream_failed) {
                    (true, _) => Some("client closed request".to_string()),
                    (_, true) => Some("upstream stream error".to_string()),
                    _ => None,
                },
                timestamp: Utc::now(),
                trace_id: Some(trace_id.clone()),
            };
            let seq = store.log_request(record.clone());
            metrics.record_request(success, client_gone);
            traces.record(Trace {
                id: trace_id,
                request_id: ctx.request_id.clone(),
                path: ctx.path.clone(),
                model: ctx.model.clone(),
                channel: Some(channel.name.clone()),
                status,
                started_at,
                duration_ms: latency_ms as u64,
                spans,
            });
            tee.dispatch(store, record, aggregate, seq);
        });

        ProxyReply::Stream {
            body: Body::from_stream(ReceiverStream::new(rx)),
        }
    }

    fn finalize(&self, args: FinalizeArgs<'_>) {
        let latency_ms = args.started.elapsed().as_millis() as i64;
        let record = RequestLog {
            id: Uuid::new_v4().to_string(),
            channel_id: args.channel.map(|ch| ch.id.clone()),
            model: args.ctx.model.clone(),
            method: args.ctx.method.clone(),
            path: args.ctx.path.clone(),
            status_code: i64::from(args.status),
            latency_ms,
            input_tokens: args.usage.input,
            output_tokens: args.usage.output,
            cached_tokens: args.usage.cached,
            success: args.success,
            error: args.error.clone(),
            timestamp: Utc::now(),
            trace_id: Some(args.trace_id.to_string()),
        };
        let seq = self.store.log_request(record.clone());
        self.metrics.record_request(args.success, args.cancelled);
        self.traces.record(Trace {
            id: args.trace_id.to_string(),
            request_id: args.ctx.request_id.clone(),
            path: args.ctx.path.clone(),
            model: args.ctx.model.clone(),
            channel: args.channel.map(|ch| ch.name.clone()),
            status: args.status,
            started_at: args.started_at,
            duration_ms: latency_ms as u64,
            spans: args.spans,
        });
        self.tee
            .dispatch(self.store.clone(), record, args.preview, seq);
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize_failure(
        &self,
        ctx: &RequestContext,
        channel: Option<&Channel>,
        err: &Error,
        started: Instant,
        started_at: chrono::DateTime<Utc>,
        trace_id: &str,
        spans: Vec<TraceSpan>,
    ) {
        self.finalize(FinalizeArgs {
            ctx,
            channel,
            status: err.status().as_u16(),
            usage: TokenUsage::default(),
            success: false,
            cancelled: false,
            error: Some(err.to_string()),
            started,
            started_at,
            trace_id,
            spans,
            preview: Value::Null,
        });
    }
}

struct FinalizeArgs<'a> {
    ctx: &'a RequestContext,
    channel: Option<&'a Channel>,
    status: u16,
    usage: TokenUsage,
    success: bool,
    cancelled: bool,
    error: Option<String>,
    started: Instant,
    started_at: chrono::DateTime<Utc>,
    trace_id: &'a str,
    spans: Vec<TraceSpan>,
    preview: Value,
}

enum AttemptResult {
    /// 2xx SSE response ready to relay
    Stream(reqwest::Response),
    /// 2xx buffered JSON response
    Json { status: StatusCode, body: Value },
    /// Terminal failure; do not retry
    Terminal(Error),
    /// Retriable failure; try another channel if attempts remain
    Retriable(Error),
}

/// Writes a 499 record if the request future is dropped before finalize
struct CancelGuard {
    store: Store,
    metrics: Arc<Metrics>,
    record: Option<RequestLog>,
    started: Instant,
}

impl CancelGuard {
    fn new(
        store: Store,
        metrics: Arc<Metrics>,
        ctx: &RequestContext,
        trace_id: String,
        started: Instant,
    ) -> Self {
        Self {
            store,
            metrics,
            record: Some(RequestLog {
                id: Uuid::new_v4().to_string(),
                channel_id: None,
                model: ctx.model.clone(),
                method: ctx.method.clone(),
                path: ctx.path.clone(),
                status_code: i64::from(STATUS_CLIENT_CLOSED),
                latency_ms: 0,
                input_tokens: 0,
                output_tokens: 0,
                cached_tokens: 0,
                success: false,
                error: Some("client closed request".to_string()),
                timestamp: Utc::now(),
                trace_id: Some(trace_id),
            }),
            started,
        }
    }

    fn set_channel(&mut self, channel: &Channel) {
        if let Some(record) = self.record.as_mut() {
            record.channel_id = Some(channel.id.clone());
        }
    }

    fn defuse(&mut self) {
        self.record = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.latency_ms = self.started.elapsed().as_millis() as i64;
            record.timestamp = Utc::now();
            self.store.log_request(record);
            self.metrics.record_request(false, true);
        }
    }
}

/// Dialect a vendor speaks on the wire
pub fn vendor_dialect(vendor: Vendor) -> Dialect {
    match vendor {
        Vendor::Anthropic => Dialect::Anthropic,
        Vendor::Google => Dialect::Gemini,
        Vendor::Openai | Vendor::Azure | Vendor::Zhipu | Vendor::Custom => Dialect::OpenAi,
    }
}

/// Convert a canonical body for the channel's dialect
///
/// Returns the outbound body plus the model name to key into the URL. Bridge
/// conversion failures degrade to the canonical body, which the upstream will
/// reject with a descriptive error of its own.
fn convert_for_vendor(body: Value, vendor: Vendor) -> (Value, String) {
    let requested = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match vendor_dialect(vendor) {
        Dialect::Anthropic => (body, requested),
        Dialect::OpenAi => {
            let mapped = dialect::map_model(&requested, Dialect::OpenAi);
            match openai::request_from_anthropic(&body) {
                Ok(converted) => (converted, mapped),
                Err(e) => {
                    tracing::warn!("openai request conversion failed: {}", e);
                    (body, mapped)
                }
            }
        }
        Dialect::Gemini => {
            let mapped = dialect::map_model(&requested, Dialect::Gemini);
            match gemini::request_from_anthropic(&body) {
                Ok(converted) => (converted, mapped),
                Err(e) => {
                    tracing::warn!("gemini request conversion failed: {}", e);
                    (body, mapped)
                }
            }
        }
    }
}

fn classify_send_error(err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else {
        Error::UpstreamError {
            status: 502,
            body: Some(err.to_string()),
        }
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(http::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn retry_after_from_error(err: &Error) -> Option<u64> {
    match err {
        Error::UpstreamError {
            status: 429,
            body: Some(body),
        } => body.parse().ok(),
        _ => None,
    }
}
