//! Admin surface under `/api`
//!
//! Handlers are thin adapters: parse, call the subsystem, wrap in the
//! `{ success, data, error }` envelope. Every write invalidates the caches
//! that serve the hot path. Api keys never leave the process unmasked.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;

use crate::crypto;
use crate::error::{Error, Result};
use crate::models::{Channel, ChannelStatus, RuleCondition, Strategy, TeeFilter, TeeKind, Vendor};
use crate::state::AppState;
use crate::store::{NewChannel, NewRoutingRule, NewTeeDestination, RequestLogFilter};

/// Characters kept on each side when masking credentials
const MASK_KEEP: usize = 4;

/// Wrap payload data in the success envelope
pub fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Channel as rendered to admins: counters included, credential masked
#[derive(Debug, Serialize)]
pub struct ChannelView {
    id: String,
    name: String,
    vendor: String,
    base_url: Option<String>,
    api_key: Option<String>,
    models: Vec<String>,
    priority: i64,
    weight: i64,
    status: String,
    request_count: i64,
    success_count: i64,
    failure_count: i64,
    consecutive_failures: i64,
    last_used_at: Option<DateTime<Utc>>,
    last_failure_time: Option<DateTime<Utc>>,
    circuit_breaker_until: Option<DateTime<Utc>>,
    rate_limited_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    transformers: Vec<String>,
}

impl From<&Channel> for ChannelView {
    fn from(channel: &Channel) -> Self {
        Self {
            id: channel.id.clone(),
            name: channel.name.clone(),
            vendor: channel.vendor.to_string(),
            base_url: channel.base_url.clone(),
            api_key: channel
                .api_key
                .as_deref()
                .map(|key| crypto::mask(key, MASK_KEEP)),
            models: channel.models.clone(),
            priority: channel.priority,
            weight: channel.weight,
            status: channel.status.to_string(),
            request_count: channel.request_count,
            success_count: channel.success_count,
            failure_count: channel.failure_count,
            consecutive_failures: channel.consecutive_failures,
            last_used_at: channel.last_used_at,
            last_failure_time: channel.last_failure_time,
            circuit_breaker_until: channel.circuit_breaker_until,
            rate_limited_until: channel.rate_limited_until,
            created_at: channel.created_at,
            updated_at: channel.updated_at,
            transformers: channel.transformers.clone(),
        }
    }
}

/// Create/update payload for channels
#[derive(Debug, Deserialize)]
pub struct ChannelPayload {
    name: String,
    vendor: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    priority: i64,
    #[serde(default = "default_weight")]
    weight: i64,
    #[serde(default)]
    transformers: Vec<String>,
    #[serde(default)]
    status: Option<String>,
}

fn default_weight() -> i64 {
    1
}

impl ChannelPayload {
    fn into_parts(self) -> Result<(NewChannel, Option<ChannelStatus>)> {
        let vendor = Vendor::from_str(&self.vendor).map_err(Error::BadRequest)?;
        let status = self
            .status
            .as_deref()
            .map(ChannelStatus::from_str)
            .transpose()
            .map_err(Error::BadRequest)?;
        Ok((
            NewChannel {
                name: self.name,
                vendor,
                base_url: self.base_url,
                api_key: self.api_key,
                refresh_token: self.refresh_token,
                models: self.models,
                priority: self.priority,
                weight: self.weight,
                transformers: self.transformers,
            },
            status,
        ))
    }
}

/// `GET /api` -- system status
pub async fn system_status(State(state): State<AppState>) -> Result<Json<Value>> {
    let channels = state.store.list_channels().await?;
    let rules = state.store.list_rules().await?;
    let tees = state.store.list_tees().await?;
    let sessions = state.store.list_sessions().await?;

    Ok(envelope(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.metrics.uptime_secs(),
        "strategy": state.balancer.strategy().to_string(),
        "cache": state.cache.stats(),
        "rate_limiter_keys": state.limiter.tracked_keys(),
        "counts": {
            "channels": channels.len(),
            "routing_rules": rules.len(),
            "tee_destinations": tees.len(),
            "oauth_sessions": sessions.len(),
        },
    })))
}

// ============================================================================
// Channels
// ============================================================================

/// `GET /api/channels`
pub async fn list_channels(State(state): State<AppState>) -> Result<Json<Value>> {
    let channels = state.store.list_channels().await?;
    let views: Vec<ChannelView> = channels.iter().map(ChannelView::from).collect();
    Ok(envelope(views))
}

/// `POST /api/channels`
pub async fn create_channel(
    State(state): State<AppState>,
    Json(payload): Json<ChannelPayload>,
) -> Result<Json<Value>> {
    let (new, _) = payload.into_parts()?;
    let channel = state.store.create_channel(new).await?;
    state.cache.invalidate_channels();
    tracing::info!(channel = %channel.name, "channel created");
    Ok(envelope(ChannelView::from(&channel)))
}

/// `GET /api/channels/{name}`
pub async fn get_channel(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let channel = state.store.get_channel_by_name(&name).await?;
    Ok(envelope(ChannelView::from(&channel)))
}

/// `PUT /api/channels/{name}`
pub async fn update_channel(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<ChannelPayload>,
) -> Result<Json<Value>> {
    let existing = state.store.get_channel_by_name(&name).await?;
    let (new, status) = payload.into_parts()?;
    let channel = state.store.update_channel(&existing.id, new, status).await?;
    state.cache.invalidate_channel(&channel.id);
    tracing::info!(channel = %channel.name, "channel updated");
    Ok(envelope(ChannelView::from(&channel)))
}

/// `DELETE /api/channels/{name}`
pub async fn delete_channel(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let existing = state.store.get_channel_by_name(&name).await?;
    state.store.delete_channel(&existing.id).await?;
    state.cache.invalidate_channels();
    tracing::info!(channel = %name, "channel deleted");
    Ok(envelope(json!({ "deleted": name })))
}

/// `POST /api/channels/{name}/test`
pub async fn test_channel(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let channel = state.store.get_channel_by_name(&name).await?;
    let latency_ms = state.engine.probe(&channel).await?;
    Ok(envelope(json!({ "name": name, "ok": true, "latency_ms": latency_ms })))
}

/// `POST /api/channels/test/all`
pub async fn test_all_channels(State(state): State<AppState>) -> Result<Json<Value>> {
    let channels = state.store.list_channels().await?;
    let mut results = Vec::with_capacity(channels.len());
    for channel in &channels {
        match state.engine.probe(channel).await {
            Ok(latency_ms) => results.push(json!({
                "name": channel.name, "ok": true, "latency_ms": latency_ms
            })),
            Err(e) => results.push(json!({
                "name": channel.name, "ok": false, "error": e.to_string()
            })),
        }
    }
    Ok(envelope(results))
}

// ============================================================================
// Strategy
// ============================================================================

/// Body of `PUT /api/strategy`
#[derive(Debug, Deserialize)]
pub struct StrategyPayload {
    strategy: String,
}

/// `PUT /api/strategy`
pub async fn set_strategy(
    State(state): State<AppState>,
    Json(payload): Json<StrategyPayload>,
) -> Result<Json<Value>> {
    let strategy = Strategy::from_str(&payload.strategy).map_err(Error::BadRequest)?;
    state.balancer.set_strategy(strategy);
    Ok(envelope(json!({ "strategy": strategy.to_string() })))
}

// ============================================================================
// Routing rules
// ============================================================================

/// Create/update payload for routing rules
#[derive(Debug, Deserialize)]
pub struct RulePayload {
    name: String,
    condition: RuleCondition,
    target_channel: String,
    #[serde(default)]
    target_model: Option<String>,
    #[serde(default)]
    priority: i64,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl From<RulePayload> for NewRoutingRule {
    fn from(payload: RulePayload) -> Self {
        NewRoutingRule {
            name: payload.name,
            condition: payload.condition,
            target_channel: payload.target_channel,
            target_model: payload.target_model,
            priority: payload.priority,
            enabled: payload.enabled,
        }
    }
}

/// `GET /api/routing/rules`
pub async fn list_rules(State(state): State<AppState>) -> Result<Json<Value>> {
    Ok(envelope(state.store.list_rules().await?))
}

/// `POST /api/routing/rules`
pub async fn create_rule(
    State(state): State<AppState>,
    Json(payload): Json<RulePayload>,
) -> Result<Json<Value>> {
    let rule = state.store.create_rule(payload.into()).await?;
    state.cache.invalidate_rules();
    tracing::info!(rule = %rule.name, "routing rule created");
    Ok(envelope(rule))
}

/// `GET /api/routing/rules/{id}`
pub async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    Ok(envelope(state.store.get_rule(&id).await?))
}

/// `PUT /api/routing/rules/{id}`
pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<RulePayload>,
) -> Result<Json<Value>> {
    let rule = state.store.update_rule(&id, payload.into()).await?;
    state.cache.invalidate_rules();
    Ok(envelope(rule))
}

/// `DELETE /api/routing/rules/{id}`
pub async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.store.delete_rule(&id).await?;
    state.cache.invalidate_rules();
    Ok(envelope(json!({ "deleted": id })))
}

// ============================================================================
// Transformers
// ============================================================================

/// Body of `POST /api/transformers`
#[derive(Debug, Deserialize)]
pub struct TransformerPayload {
    id: String,
    #[serde(default)]
    settings: Value,
}

/// `GET /api/transformers`
pub async fn list_transformers(State(state): State<AppState>) -> Result<Json<Value>> {
    Ok(envelope(json!({
        "installed": state.pipeline.list(),
        "available": state.pipeline.known_ids(),
    })))
}

/// `POST /api/transformers`
pub async fn install_transformer(
    State(state): State<AppState>,
    Json(payload): Json<TransformerPayload>,
) -> Result<Json<Value>> {
    let settings = if payload.settings.is_null() {
        json!({})
    } else {
        payload.settings
    };
    let info = state.pipeline.install(&payload.id, settings)?;
    tracing::info!(transformer = %info.id, "transformer installed");
    Ok(envelope(info))
}

/// `PUT /api/transformers/{id}`
pub async fn update_transformer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(settings): Json<Value>,
) -> Result<Json<Value>> {
    let info = state.pipeline.install(&id, settings)?;
    Ok(envelope(info))
}

// ============================================================================
// Tee destinations
// ============================================================================

/// Create/update payload for tee destinations
#[derive(Debug, Deserialize)]
pub struct TeePayload {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    handler: Option<String>,
    #[serde(default)]
    filter: TeeFilter,
    #[serde(default = "default_retries")]
    retries: u32,
    #[serde(default = "default_tee_timeout")]
    timeout_secs: u64,
}

fn default_retries() -> u32 {
    3
}

fn default_tee_timeout() -> u64 {
    5
}

impl TeePayload {
    fn into_new(self) -> Result<NewTeeDestination> {
        let kind = TeeKind::from_str(&self.kind).map_err(Error::BadRequest)?;
        Ok(NewTeeDestination {
            name: self.name,
            kind,
            enabled: self.enabled,
            url: self.url,
            method: self.method,
            headers: self.headers,
            file_path: self.file_path,
            handler: self.handler,
            filter: self.filter,
            retries: self.retries,
            timeout_secs: self.timeout_secs,
        })
    }
}

/// `GET /api/tee`
pub async fn list_tees(State(state): State<AppState>) -> Result<Json<Value>> {
    Ok(envelope(state.store.list_tees().await?))
}

/// `POST /api/tee`
pub async fn create_tee(
    State(state): State<AppState>,
    Json(payload): Json<TeePayload>,
) -> Result<Json<Value>> {
    let destination = state.store.create_tee(payload.into_new()?).await?;
    tracing::info!(destination = %destination.name, "tee destination created");
    Ok(envelope(destination))
}

/// `PUT /api/tee/{id}`
pub async fn update_tee(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<TeePayload>,
) -> Result<Json<Value>> {
    let destination = state.store.update_tee(&id, payload.into_new()?).await?;
    Ok(envelope(destination))
}

/// `DELETE /api/tee/{id}`
pub async fn delete_tee(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.store.delete_tee(&id).await?;
    Ok(envelope(json!({ "deleted": id })))
}

// ============================================================================
// Analytics, metrics, requests, tracing
// ============================================================================

/// `GET /api/analytics`
pub async fn analytics(State(state): State<AppState>) -> Result<Json<Value>> {
    Ok(envelope(state.store.analytics().await?))
}

/// `GET /api/metrics`
pub async fn metrics(State(state): State<AppState>) -> Result<Json<Value>> {
    Ok(envelope(state.metrics.snapshot()))
}

/// `POST /api/metrics/reset`
pub async fn reset_metrics(State(state): State<AppState>) -> Result<Json<Value>> {
    state.metrics.reset();
    Ok(envelope(json!({ "reset": true })))
}

/// Query parameters of `GET /api/requests`
#[derive(Debug, Default, Deserialize)]
pub struct RequestsQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    model: Option<String>,
    /// Path substring
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    since: Option<DateTime<Utc>>,
    #[serde(default)]
    until: Option<DateTime<Utc>>,
}

/// `GET /api/requests`
pub async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<RequestsQuery>,
) -> Result<Json<Value>> {
    let filter = RequestLogFilter {
        status_code: query.status,
        channel_id: query.channel,
        model: query.model,
        path: query.q,
        since: query.since,
        until: query.until,
        limit: query.limit,
        offset: query.offset,
    };
    Ok(envelope(state.store.requests_filtered(&filter).await?))
}

/// `GET /api/tracing/stats`
pub async fn tracing_stats(State(state): State<AppState>) -> Result<Json<Value>> {
    Ok(envelope(state.traces.stats()))
}

/// `GET /api/tracing/traces`
pub async fn list_traces(State(state): State<AppState>) -> Result<Json<Value>> {
    Ok(envelope(state.traces.summaries()))
}

/// `GET /api/tracing/traces/{id}`
pub async fn get_trace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let trace = state
        .traces
        .get(&id)
        .ok_or_else(|| Error::NotFound(format!("trace '{}'", id)))?;
    Ok(envelope(trace))
}

/// `POST /api/tracing/clear`
pub async fn clear_traces(State(state): State<AppState>) -> Result<Json<Value>> {
    state.traces.clear();
    Ok(envelope(json!({ "cleared": true })))
}
