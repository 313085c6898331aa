//! Domain model shared across the gateway subsystems
//!
//! Channels are owned by the store; other subsystems hold read-only
//! snapshots. Counter and health mutations flow through the health registry,
//! never by editing a snapshot in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Upstream vendor family, controls URL and header construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    /// Anthropic Messages API
    Anthropic,
    /// OpenAI Chat Completions API
    Openai,
    /// Google Gemini generateContent API
    Google,
    /// Azure-hosted OpenAI deployment
    Azure,
    /// Zhipu AI (OpenAI-compatible)
    Zhipu,
    /// Custom OpenAI-compatible endpoint
    Custom,
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Vendor::Anthropic => "anthropic",
            Vendor::Openai => "openai",
            Vendor::Google => "google",
            Vendor::Azure => "azure",
            Vendor::Zhipu => "zhipu",
            Vendor::Custom => "custom",
        };
        write!(f, "{}", tag)
    }
}

impl FromStr for Vendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(Vendor::Anthropic),
            "openai" => Ok(Vendor::Openai),
            "google" => Ok(Vendor::Google),
            "azure" => Ok(Vendor::Azure),
            "zhipu" => Ok(Vendor::Zhipu),
            "custom" => Ok(Vendor::Custom),
            other => Err(format!("unknown vendor '{}'", other)),
        }
    }
}

/// Channel availability state
///
/// `Enabled`/`Disabled` are admin-set; `RateLimited`/`CircuitBreaker` are set
/// by the health state machine and carry an expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Selectable
    Enabled,
    /// Admin-disabled, never selectable
    Disabled,
    /// Cooling down after an upstream 429
    RateLimited,
    /// Circuit open after repeated failures
    CircuitBreaker,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ChannelStatus::Enabled => "enabled",
            ChannelStatus::Disabled => "disabled",
            ChannelStatus::RateLimited => "rate_limited",
            ChannelStatus::CircuitBreaker => "circuit_breaker",
        };
        write!(f, "{}", tag)
    }
}

impl FromStr for ChannelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(ChannelStatus::Enabled),
            "disabled" => Ok(ChannelStatus::Disabled),
            "rate_limited" => Ok(ChannelStatus::RateLimited),
            "circuit_breaker" => Ok(ChannelStatus::CircuitBreaker),
            other => Err(format!("unknown channel status '{}'", other)),
        }
    }
}

/// One configured outbound credential+endpoint pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Stable id
    pub id: String,
    /// Unique name, used in admin paths and rule targets
    pub name: String,
    /// Vendor family
    pub vendor: Vendor,
    /// Override base URL; vendor default when absent
    pub base_url: Option<String>,
    /// Decrypted api key; at rest this is ciphertext only
    pub api_key: Option<String>,
    /// Optional refresh token (admin-side concern)
    pub refresh_token: Option<String>,
    /// Models this channel serves; empty means all
    pub models: Vec<String>,
    /// Selection priority, higher first
    pub priority: i64,
    /// Weighted-random weight, ≥ 1
    pub weight: i64,
    /// Availability state
    pub status: ChannelStatus,
    /// Total requests attempted
    pub request_count: i64,
    /// Successful requests
    pub success_count: i64,
    /// Failed requests
    pub failure_count: i64,
    /// Failures since the last success
    pub consecutive_failures: i64,
    /// Last selection time
    pub last_used_at: Option<DateTime<Utc>>,
    /// Last failure time
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Circuit stays open until this instant
    pub circuit_breaker_until: Option<DateTime<Utc>>,
    /// Rate-limit cooldown until this instant
    pub rate_limited_until: Option<DateTime<Utc>>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Row update time
    pub updated_at: DateTime<Utc>,
    /// Channel-scoped transformer ids applied on top of the global pipeline
    pub transformers: Vec<String>,
}

impl Channel {
    /// Whether this channel serves the given model (empty list serves all)
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    /// Whether this channel may be selected at `now`
    ///
    /// `circuit_breaker` and `rate_limited` channels become eligible again
    /// once their window has passed (the circuit case is a half-open probe).
    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ChannelStatus::Enabled => true,
            ChannelStatus::Disabled => false,
            ChannelStatus::RateLimited => self
                .rate_limited_until
                .map(|until| now >= until)
                .unwrap_or(true),
            ChannelStatus::CircuitBreaker => self
                .circuit_breaker_until
                .map(|until| now >= until)
                .unwrap_or(true),
        }
    }
}

/// Structured predicate of a routing rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Model name equals
    ModelEquals {
        /// Exact model name
        model: String,
    },
    /// Model name starts with
    ModelPrefix {
        /// Prefix to match
        prefix: String,
    },
    /// Model name contains
    ModelContains {
        /// Substring to match
        substring: String,
    },
    /// Request path starts with
    PathPrefix {
        /// Path prefix
        prefix: String,
    },
    /// A request header equals a value (name compared case-insensitively)
    HeaderEquals {
        /// Header name
        name: String,
        /// Expected value
        value: String,
    },
    /// Authenticated user id equals
    UserEquals {
        /// User id
        user: String,
    },
    /// Request carries a tag
    HasTag {
        /// Tag to look for
        tag: String,
    },
}

/// Target channel sentinel meaning "any channel via the load balancer"
pub const ANY_CHANNEL: &str = "*";

/// One routing rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Stable id
    pub id: String,
    /// Display name; also the tie-break sort key
    pub name: String,
    /// Match predicate
    pub condition: RuleCondition,
    /// Target channel name, or [`ANY_CHANNEL`]
    pub target_channel: String,
    /// Optional model override applied when the rule fires
    pub target_model: Option<String>,
    /// Evaluation priority, higher first
    pub priority: i64,
    /// Disabled rules never fire
    pub enabled: bool,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Row update time
    pub updated_at: DateTime<Utc>,
}

/// Tee destination kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeeKind {
    /// Plain HTTP POST/PUT of the record
    Http,
    /// Webhook-style HTTP delivery
    Webhook,
    /// JSON-line append to a local file
    File,
    /// Registered custom handler
    Custom,
}

impl fmt::Display for TeeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            TeeKind::Http => "http",
            TeeKind::Webhook => "webhook",
            TeeKind::File => "file",
            TeeKind::Custom => "custom",
        };
        write!(f, "{}", tag)
    }
}

impl FromStr for TeeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(TeeKind::Http),
            "webhook" => Ok(TeeKind::Webhook),
            "file" => Ok(TeeKind::File),
            "custom" => Ok(TeeKind::Custom),
            other => Err(format!("unknown tee kind '{}'", other)),
        }
    }
}

/// Record filter attached to a tee destination
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeeFilter {
    /// Deliver only these models; empty = all
    #[serde(default)]
    pub models: Vec<String>,
    /// Deliver only these status codes; empty = all
    #[serde(default)]
    pub status_codes: Vec<u16>,
}

impl TeeFilter {
    /// Whether a finalized record passes this filter
    pub fn matches(&self, record: &RequestLog) -> bool {
        let model_ok = self.models.is_empty() || self.models.iter().any(|m| m == &record.model);
        let status_ok = self.status_codes.is_empty()
            || self
                .status_codes
                .iter()
                .any(|s| i64::from(*s) == record.status_code);
        model_ok && status_ok
    }
}

/// One configured tee sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeeDestination {
    /// Stable id
    pub id: String,
    /// Unique name
    pub name: String,
    /// Destination kind
    pub kind: TeeKind,
    /// Disabled destinations receive nothing
    pub enabled: bool,
    /// HTTP/webhook target URL
    pub url: Option<String>,
    /// HTTP method, POST by default
    pub method: Option<String>,
    /// Extra headers for HTTP delivery
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// File path for file destinations
    pub file_path: Option<String>,
    /// Registered handler id for custom destinations
    pub handler: Option<String>,
    /// Record filter
    #[serde(default)]
    pub filter: TeeFilter,
    /// Maximum delivery attempts
    pub retries: u32,
    /// Per-attempt timeout in seconds
    pub timeout_secs: u64,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Row update time
    pub updated_at: DateTime<Utc>,
}

/// Finalized record of one proxied request; append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    /// Stable id
    pub id: String,
    /// Channel that served (or last attempted) the request
    pub channel_id: Option<String>,
    /// Requested model after overrides
    pub model: String,
    /// Ingress HTTP method
    pub method: String,
    /// Ingress path
    pub path: String,
    /// Final status code returned to the caller (499 on client cancel)
    pub status_code: i64,
    /// Wall-clock latency in milliseconds
    pub latency_ms: i64,
    /// Input tokens reported by the upstream
    pub input_tokens: i64,
    /// Output tokens reported by the upstream
    pub output_tokens: i64,
    /// Cache-read tokens reported by the upstream
    pub cached_tokens: i64,
    /// Whether the request succeeded end to end
    pub success: bool,
    /// Terminal error string, when any
    pub error: Option<String>,
    /// Completion time
    pub timestamp: DateTime<Utc>,
    /// Trace id for correlation with the span store
    pub trace_id: Option<String>,
}

/// One OAuth session row; the core only reads, never refreshes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSession {
    /// Stable id
    pub id: String,
    /// Channel this session is bound to, when any
    pub channel_id: Option<String>,
    /// Provider tag
    pub provider: String,
    /// Access token
    pub access_token: String,
    /// Refresh token, when the provider issued one
    pub refresh_token: Option<String>,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Provider user info payload
    pub user_info: Option<serde_json::Value>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Row update time
    pub updated_at: DateTime<Utc>,
}

impl OAuthSession {
    /// A session at or past its expiry is unusable on the hot path
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Load-balancing strategy, process-wide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Highest priority first, round-robin within a priority band
    Priority,
    /// Rotating index over name-sorted candidates
    RoundRobin,
    /// Weight-proportional random pick
    Weighted,
    /// Fewest requests served first
    LeastUsed,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Strategy::Priority => "priority",
            Strategy::RoundRobin => "round_robin",
            Strategy::Weighted => "weighted",
            Strategy::LeastUsed => "least_used",
        };
        write!(f, "{}", tag)
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority" => Ok(Strategy::Priority),
            "round_robin" => Ok(Strategy::RoundRobin),
            "weighted" => Ok(Strategy::Weighted),
            "least_used" => Ok(Strategy::LeastUsed),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// Request attributes visible to routing rules and transformers
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Requested model (after any rule override)
    pub model: String,
    /// Ingress path
    pub path: String,
    /// Ingress method
    pub method: String,
    /// Lowercased request headers
    pub headers: HashMap<String, String>,
    /// Caller user id, when known
    pub user_id: Option<String>,
    /// Request tags (from `x-routex-tags`)
    pub tags: Vec<String>,
    /// Whether the caller asked for SSE
    pub stream: bool,
    /// Request id assigned at ingress
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn channel() -> Channel {
        let now = Utc::now();
        Channel {
            id: "ch-1".into(),
            name: "primary".into(),
            vendor: Vendor::Anthropic,
            base_url: None,
            api_key: Some("sk-test".into()),
            refresh_token: None,
            models: vec!["claude-opus-4".into()],
            priority: 10,
            weight: 1,
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
    fn test_supports_model() {
        let mut ch = channel();
        assert!(ch.supports_model("claude-opus-4"));
        assert!(!ch.supports_model("gpt-4o"));

        ch.models.clear();
        assert!(ch.supports_model("anything"));
    }

    #[test]
    fn test_selectable_window_boundaries() {
        let now = Utc::now();
        let mut ch = channel();

        ch.status = ChannelStatus::CircuitBreaker;
        ch.circuit_breaker_until = Some(now - Duration::seconds(1));
        assert!(ch.is_selectable(now), "expired window is eligible");

        ch.circuit_breaker_until = Some(now + Duration::seconds(1));
        assert!(!ch.is_selectable(now), "live window is not eligible");

        ch.status = ChannelStatus::Disabled;
        assert!(!ch.is_selectable(now));
    }

    #[test]
    fn test_tee_filter() {
        let record = RequestLog {
            id: "r1".into(),
            channel_id: Some("ch-1".into()),
            model: "claude-opus-4".into(),
            method: "POST".into(),
            path: "/v1/messages".into(),
            status_code: 200,
            latency_ms: 42,
            input_tokens: 10,
            output_tokens: 20,
            cached_tokens: 0,
            success: true,
            error: None,
            timestamp: Utc::now(),
            trace_id: None,
        };

        assert!(TeeFilter::default().matches(&record));
        assert!(TeeFilter {
            models: vec!["claude-opus-4".into()],
            status_codes: vec![200],
        }
        .matches(&record));
        assert!(!TeeFilter {
            models: vec!["gpt-4o".into()],
            status_codes: Vec::new(),
        }
        .matches(&record));
        assert!(!TeeFilter {
            models: Vec::new(),
            status_codes: vec![500],
        }
        .matches(&record));
    }

    #[test]
    fn test_rule_condition_serde_tagging() {
        let condition = RuleCondition::ModelEquals {
            model: "claude-opus-4".into(),
        };
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "model_equals");
        let back: RuleCondition = serde_json::from_value(json).unwrap();
        assert_eq!(back, condition);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("priority".parse::<Strategy>().unwrap(), Strategy::Priority);
        assert_eq!(
            "least_used".parse::<Strategy>().unwrap(),
            Strategy::LeastUsed
        );
        assert!("fastest".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        let session = OAuthSession {
            id: "s1".into(),
            channel_id: None,
            provider: "anthropic".into(),
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: now,
            scopes: Vec::new(),
            user_info: None,
            created_at: now,
            updated_at: now,
        };
        assert!(session.is_expired(now), "expiry at now is expired");
        assert!(!session.is_expired(now - Duration::seconds(1)));
    }
}
