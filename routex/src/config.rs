//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: ROUTEX_, nested keys split on __)
//! 2. Well-known unprefixed variables (MASTER_PASSWORD, LOG_LEVEL, TTL_*, SQLITE_*)
//! 3. Current working directory: ./routex.toml
//! 4. Default values
//!
//! After loading, every string leaf supports `${VAR}` / `$VAR` interpolation
//! against the process environment, so credentials can live outside the file.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Credential encryption settings
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// SQLite store settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Adaptive cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Proxy engine settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Ingress rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Request signature verification
    #[serde(default)]
    pub signature: SignatureConfig,

    /// Per-model pricing used by analytics
    #[serde(default)]
    pub pricing: PricingConfig,

    /// OAuth provider registry (session store contract only)
    #[serde(default)]
    pub oauth: HashMap<String, OAuthProviderConfig>,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Maximum accepted request body in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

/// Credential encryption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Master password used to derive the AEAD key; must be at least 32 chars
    #[serde(default)]
    pub master_password: String,

    /// Optional deterministic salt, hex encoded
    #[serde(default)]
    pub encryption_salt: Option<String>,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            master_password: String::new(),
            encryption_salt: None,
        }
    }
}

/// SQLite store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path, or ":memory:"
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Maximum number of pool connections
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,

    /// PRAGMA cache_size value
    #[serde(default = "default_sqlite_cache_size")]
    pub cache_size: i64,

    /// PRAGMA mmap_size value in bytes
    #[serde(default = "default_sqlite_mmap_size")]
    pub mmap_size: i64,

    /// PRAGMA busy_timeout in milliseconds
    #[serde(default = "default_sqlite_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Maximum retry attempts for establishing the pool
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Request-log buffer capacity before a forced flush
    #[serde(default = "default_log_batch_size")]
    pub log_batch_size: usize,

    /// Request-log flush interval in milliseconds
    #[serde(default = "default_log_flush_interval_ms")]
    pub log_flush_interval_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_db_max_connections(),
            cache_size: default_sqlite_cache_size(),
            mmap_size: default_sqlite_mmap_size(),
            busy_timeout_ms: default_sqlite_busy_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            log_batch_size: default_log_batch_size(),
            log_flush_interval_ms: default_log_flush_interval_ms(),
        }
    }
}

/// Adaptive cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lower TTL clamp in seconds
    #[serde(default = "default_ttl_min")]
    pub ttl_min_secs: u64,

    /// Upper TTL clamp in seconds
    #[serde(default = "default_ttl_max")]
    pub ttl_max_secs: u64,

    /// Starting TTL in seconds
    #[serde(default = "default_ttl_default")]
    pub ttl_default_secs: u64,

    /// Hit rate the controller converges toward
    #[serde(default = "default_target_hit_rate")]
    pub target_hit_rate: f64,

    /// Controller adjustment interval in seconds
    #[serde(default = "default_adjustment_interval")]
    pub adjustment_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_min_secs: default_ttl_min(),
            ttl_max_secs: default_ttl_max(),
            ttl_default_secs: default_ttl_default(),
            target_hit_rate: default_target_hit_rate(),
            adjustment_interval_secs: default_adjustment_interval(),
        }
    }
}

/// Proxy engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Maximum channel attempts per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-attempt timeout for non-streaming requests, seconds
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Per-transformer timeout, seconds
    #[serde(default = "default_transform_timeout")]
    pub transform_timeout_secs: u64,

    /// Cap on the in-memory copy of a streamed body, bytes
    #[serde(default = "default_stream_buffer_cap")]
    pub stream_buffer_cap_bytes: usize,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Base circuit-open window, seconds
    #[serde(default = "default_circuit_open")]
    pub circuit_open_secs: u64,

    /// Ceiling for the backed-off circuit window, seconds
    #[serde(default = "default_circuit_open_max")]
    pub circuit_open_max_secs: u64,

    /// Ceiling applied to upstream Retry-After windows, seconds
    #[serde(default = "default_rate_limit_max")]
    pub rate_limited_max_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            upstream_timeout_secs: default_upstream_timeout(),
            transform_timeout_secs: default_transform_timeout(),
            stream_buffer_cap_bytes: default_stream_buffer_cap(),
            failure_threshold: default_failure_threshold(),
            circuit_open_secs: default_circuit_open(),
            circuit_open_max_secs: default_circuit_open_max(),
            rate_limited_max_secs: default_rate_limit_max(),
        }
    }
}

impl ProxyConfig {
    /// Per-attempt upstream timeout as a Duration
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Per-transformer timeout as a Duration
    pub fn transform_timeout(&self) -> Duration {
        Duration::from_secs(self.transform_timeout_secs)
    }
}

/// Ingress rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether the limiter is active
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Preset name: strict, standard, lenient, proxy, auth
    #[serde(default = "default_rate_limit_preset")]
    pub preset: String,

    /// Override: maximum requests per window (takes precedence over preset)
    #[serde(default)]
    pub max_requests: Option<u32>,

    /// Override: window length in milliseconds
    #[serde(default)]
    pub window_ms: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preset: default_rate_limit_preset(),
            max_requests: None,
            window_ms: None,
        }
    }
}

/// Request signature verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Whether signature verification is required on the hot path
    #[serde(default)]
    pub enabled: bool,

    /// Shared HMAC secret
    #[serde(default)]
    pub secret: String,

    /// Allowed clock skew in seconds
    #[serde(default = "default_signature_tolerance")]
    pub tolerance_secs: u64,

    /// Request headers folded into the signed string, in order
    #[serde(default)]
    pub signed_headers: Vec<String>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: String::new(),
            tolerance_secs: default_signature_tolerance(),
            signed_headers: Vec::new(),
        }
    }
}

/// Per-model pricing used by analytics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// USD per 1M input tokens for models absent from the table
    #[serde(default = "default_input_price")]
    pub default_input_per_mtok: f64,

    /// USD per 1M output tokens for models absent from the table
    #[serde(default = "default_output_price")]
    pub default_output_per_mtok: f64,

    /// Model-specific rows, keyed by model name
    #[serde(default)]
    pub models: HashMap<String, ModelPrice>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_input_per_mtok: default_input_price(),
            default_output_per_mtok: default_output_price(),
            models: HashMap::new(),
        }
    }
}

impl PricingConfig {
    /// Cost in USD for a token count against a model
    pub fn cost(&self, model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
        let (input_rate, output_rate) = match self.models.get(model) {
            Some(price) => (price.input_per_mtok, price.output_per_mtok),
            None => (self.default_input_per_mtok, self.default_output_per_mtok),
        };
        (input_tokens as f64 * input_rate + output_tokens as f64 * output_rate) / 1_000_000.0
    }
}

/// One pricing row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrice {
    /// USD per 1M input tokens
    pub input_per_mtok: f64,
    /// USD per 1M output tokens
    pub output_per_mtok: f64,
}

/// OAuth provider entry: enough to build an authorize URL and accept a callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    /// OAuth client id
    pub client_id: String,

    /// OAuth client secret
    #[serde(default)]
    pub client_secret: String,

    /// Authorization endpoint
    pub authorize_url: String,

    /// Token endpoint
    #[serde(default)]
    pub token_url: String,

    /// Scopes requested at authorization
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Config {
    /// Load configuration from defaults, `routex.toml`, and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("routex.toml"))
    }

    /// Load configuration with an explicit TOML path
    pub fn load_from(path: &Path) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ROUTEX_").split("__"));

        let mut config: Config = figment.extract()?;

        config.apply_well_known_env();
        config = config.interpolated(|var| std::env::var(var).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Fold in the unprefixed environment variables the gateway documents
    fn apply_well_known_env(&mut self) {
        if let Ok(v) = std::env::var("MASTER_PASSWORD") {
            self.crypto.master_password = v;
        }
        if let Ok(v) = std::env::var("ENCRYPTION_SALT") {
            self.crypto.encryption_salt = Some(v);
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Ok(v) = std::env::var("LOG_FORMAT") {
            self.server.log_format = v;
        }
        if let Ok(v) = parse_env("SQLITE_CACHE_SIZE") {
            self.database.cache_size = v;
        }
        if let Ok(v) = parse_env("SQLITE_MMAP_SIZE") {
            self.database.mmap_size = v;
        }
        if let Ok(v) = parse_env("SQLITE_BUSY_TIMEOUT") {
            self.database.busy_timeout_ms = v;
        }
        if let Ok(v) = parse_env("TTL_MIN") {
            self.cache.ttl_min_secs = v;
        }
        if let Ok(v) = parse_env("TTL_MAX") {
            self.cache.ttl_max_secs = v;
        }
        if let Ok(v) = parse_env("TTL_DEFAULT").or_else(|_| parse_env("DB_CACHE_TTL")) {
            self.cache.ttl_default_secs = v;
        }
        if let Ok(v) = parse_env("TTL_TARGET_HIT_RATE") {
            self.cache.target_hit_rate = v;
        }
    }

    /// Interpolate `${VAR}` / `$VAR` in every string leaf
    ///
    /// Implemented as a pure pass over the serialized tree so new fields are
    /// covered without per-field code.
    fn interpolated<F>(self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String> + Copy,
    {
        let mut value = serde_json::to_value(&self)
            .map_err(|e| Error::Config(format!("config serialization failed: {}", e)))?;
        interpolate_value(&mut value, lookup);
        serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("config re-parse failed: {}", e)))
    }

    /// Reject configurations the gateway cannot boot with
    fn validate(&self) -> Result<()> {
        if self.crypto.master_password.len() < 32 {
            return Err(Error::Config(
                "MASTER_PASSWORD must be at least 32 characters".to_string(),
            ));
        }
        if let Some(salt) = &self.crypto.encryption_salt {
            if hex::decode(salt).is_err() {
                return Err(Error::Config(
                    "ENCRYPTION_SALT must be hex encoded".to_string(),
                ));
            }
        }
        if self.cache.ttl_min_secs > self.cache.ttl_max_secs {
            return Err(Error::Config("TTL_MIN exceeds TTL_MAX".to_string()));
        }
        if !(0.0..=1.0).contains(&self.cache.target_hit_rate) {
            return Err(Error::Config(
                "TTL_TARGET_HIT_RATE must be in [0, 1]".to_string(),
            ));
        }
        if self.proxy.max_attempts == 0 {
            return Err(Error::Config("proxy.max_attempts must be ≥ 1".to_string()));
        }
        if self.signature.enabled && self.signature.secret.is_empty() {
            return Err(Error::Config(
                "signature.secret required when signature verification is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve `${VAR}` and `$VAR` references in one string
pub fn interpolate<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                match (closed, lookup(&name)) {
                    (true, Some(value)) => out.push_str(&value),
                    // Unknown or unterminated references are kept verbatim
                    (true, None) => {
                        out.push_str("${");
                        out.push_str(&name);
                        out.push('}');
                    }
                    (false, _) => {
                        out.push_str("${");
                        out.push_str(&name);
                    }
                }
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match lookup(&name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push('$'),
        }
    }

    out
}

fn interpolate_value<F>(value: &mut serde_json::Value, lookup: F)
where
    F: Fn(&str) -> Option<String> + Copy,
{
    match value {
        serde_json::Value::String(s) => {
            if s.contains('$') {
                *s = interpolate(s, lookup);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                interpolate_value(item, lookup);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_value(item, lookup);
            }
        }
        _ => {}
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> std::result::Result<T, ()> {
    std::env::var(name)
        .map_err(|_| ())
        .and_then(|v| v.parse().map_err(|_| ()))
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

fn default_db_path() -> String {
    "routex.db".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_sqlite_cache_size() -> i64 {
    -64_000
}

fn default_sqlite_mmap_size() -> i64 {
    256 * 1024 * 1024
}

fn default_sqlite_busy_timeout() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1
}

fn default_log_batch_size() -> usize {
    500
}

fn default_log_flush_interval_ms() -> u64 {
    1_000
}

fn default_ttl_min() -> u64 {
    5
}

fn default_ttl_max() -> u64 {
    300
}

fn default_ttl_default() -> u64 {
    60
}

fn default_target_hit_rate() -> f64 {
    0.85
}

fn default_adjustment_interval() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_transform_timeout() -> u64 {
    5
}

fn default_stream_buffer_cap() -> usize {
    4 * 1024 * 1024
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_open() -> u64 {
    30
}

fn default_circuit_open_max() -> u64 {
    300
}

fn default_rate_limit_max() -> u64 {
    300
}

fn default_rate_limit_preset() -> String {
    "proxy".to_string()
}

fn default_signature_tolerance() -> u64 {
    300
}

fn default_input_price() -> f64 {
    3.0
}

fn default_output_price() -> f64 {
    15.0
}

fn default_true() -> bool {
    true
}
