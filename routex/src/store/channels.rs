//! Channel rows: CRUD plus the single-writer runtime update path
//!
//! Api keys are encrypted before INSERT/UPDATE and decrypted after SELECT.
//! Health and counter mutations go through [`Store::update_channel_runtime`]
//! so row state and in-memory state cannot drift from concurrent writers.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Store;
use crate::crypto;
use crate::error::{Error, Result};
use crate::models::{Channel, ChannelStatus, Vendor};

/// Raw row as stored
#[derive(Debug, FromRow)]
struct ChannelRow {
    id: String,
    name: String,
    vendor: String,
    base_url: Option<String>,
    api_key: Option<String>,
    refresh_token: Option<String>,
    models: String,
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
    transformers: String,
}

/// Fields a new channel is created from
#[derive(Debug, Clone)]
pub struct NewChannel {
    /// Unique name
    pub name: String,
    /// Vendor family
    pub vendor: Vendor,
    /// Optional base URL override
    pub base_url: Option<String>,
    /// Plaintext api key; encrypted before storage
    pub api_key: Option<String>,
    /// Optional refresh token
    pub refresh_token: Option<String>,
    /// Supported models; empty = all
    pub models: Vec<String>,
    /// Selection priority
    pub priority: i64,
    /// Weighted-random weight
    pub weight: i64,
    /// Channel-scoped transformer ids
    pub transformers: Vec<String>,
}

/// Runtime fields owned by the health registry
#[derive(Debug, Clone)]
pub struct ChannelRuntime {
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
    /// Circuit-open expiry
    pub circuit_breaker_until: Option<DateTime<Utc>>,
    /// Rate-limit cooldown expiry
    pub rate_limited_until: Option<DateTime<Utc>>,
}

impl Store {
    /// Insert a channel; the api key is stored encrypted
    pub async fn create_channel(&self, new: NewChannel) -> Result<Channel> {
        if new.weight < 1 {
            return Err(Error::BadRequest("channel weight must be ≥ 1".to_string()));
        }

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let api_key_ct = match &new.api_key {
            Some(plain) => Some(self.cipher.encrypt(plain)?),
            None => None,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO channels
                (id, name, vendor, base_url, api_key, refresh_token, models,
                 priority, weight, status, created_at, updated_at, transformers)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'enabled', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(new.vendor.to_string())
        .bind(&new.base_url)
        .bind(&api_key_ct)
        .bind(&new.refresh_token)
        .bind(serde_json::to_string(&new.models)?)
        .bind(new.priority)
        .bind(new.weight)
        .bind(now)
        .bind(now)
        .bind(serde_json::to_string(&new.transformers)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.get_channel(&id).await,
            Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
                "channel '{}' already exists",
                new.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch one channel by id, decrypting its credential
    pub async fn get_channel(&self, id: &str) -> Result<Channel> {
        let row: ChannelRow = sqlx::query_as("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel '{}'", id)))?;
        self.channel_from_row(row)
    }

    /// Fetch one channel by unique name
    pub async fn get_channel_by_name(&self, name: &str) -> Result<Channel> {
        let row: ChannelRow = sqlx::query_as("SELECT * FROM channels WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("channel '{}'", name)))?;
        self.channel_from_row(row)
    }

    /// All channels, name order
    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows: Vec<ChannelRow> = sqlx::query_as("SELECT * FROM channels ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| self.channel_from_row(r)).collect()
    }

    /// Channels not admin-disabled, name order
    ///
    /// Rate-limited and circuit-open channels are included; eligibility at
    /// the current instant is the selector's concern.
    pub async fn list_enabled_channels(&self) -> Result<Vec<Channel>> {
        let rows: Vec<ChannelRow> =
            sqlx::query_as("SELECT * FROM channels WHERE status != 'disabled' ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(|r| self.channel_from_row(r)).collect()
    }

    /// Update admin-owned channel fields
    ///
    /// When `api_key` is `Some`, the new plaintext is encrypted and replaces
    /// the stored ciphertext; `None` leaves the credential untouched.
    pub async fn update_channel(
        &self,
        id: &str,
        update: NewChannel,
        status: Option<ChannelStatus>,
    ) -> Result<Channel> {
        if update.weight < 1 {
            return Err(Error::BadRequest("channel weight must be ≥ 1".to_string()));
        }

        let existing = self.get_channel(id).await?;
        let now = Utc::now();

        let api_key_ct = match &update.api_key {
            Some(plain) => Some(self.cipher.encrypt(plain)?),
            None => match &existing.api_key {
                Some(plain) => Some(self.cipher.encrypt(plain)?),
                None => None,
            },
        };

        let status = status.unwrap_or(existing.status);

        let result = sqlx::query(
            r#"
            UPDATE channels SET
                name = ?, vendor = ?, base_url = ?, api_key = ?, refresh_token = ?,
                models = ?, priority = ?, weight = ?, status = ?, updated_at = ?,
                transformers = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.name)
        .bind(update.vendor.to_string())
        .bind(&update.base_url)
        .bind(&api_key_ct)
        .bind(&update.refresh_token)
        .bind(serde_json::to_string(&update.models)?)
        .bind(update.priority)
        .bind(update.weight)
        .bind(status.to_string())
        .bind(now)
        .bind(serde_json::to_string(&update.transformers)?)
        .bind(id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.get_channel(id).await,
            Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
                "channel '{}' already exists",
                update.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the runtime mirror written by the health registry
    pub async fn update_channel_runtime(&self, id: &str, runtime: &ChannelRuntime) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE channels SET
                status = ?, request_count = ?, success_count = ?, failure_count = ?,
                consecutive_failures = ?, last_used_at = ?, last_failure_time = ?,
                circuit_breaker_until = ?, rate_limited_until = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(runtime.status.to_string())
        .bind(runtime.request_count)
        .bind(runtime.success_count)
        .bind(runtime.failure_count)
        .bind(runtime.consecutive_failures)
        .bind(runtime.last_used_at)
        .bind(runtime.last_failure_time)
        .bind(runtime.circuit_breaker_until)
        .bind(runtime.rate_limited_until)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a channel by id
    pub async fn delete_channel(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("channel '{}'", id)));
        }
        Ok(())
    }

    /// Raw stored api-key column for one channel (ciphertext), tests and
    /// at-rest audits only
    pub async fn raw_channel_api_key(&self, id: &str) -> Result<Option<String>> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT api_key FROM channels WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        raw.ok_or_else(|| Error::NotFound(format!("channel '{}'", id)))
    }

    fn channel_from_row(&self, row: ChannelRow) -> Result<Channel> {
        let api_key = match row.api_key {
            Some(ct) if crypto::is_encrypted(&ct) => Some(self.cipher.decrypt(&ct)?),
            Some(_) => return Err(Error::BadCiphertext),
            None => None,
        };

        Ok(Channel {
            id: row.id,
            name: row.name,
            vendor: row
                .vendor
                .parse()
                .map_err(|e: String| Error::Database(e))?,
            base_url: row.base_url,
            api_key,
            refresh_token: row.refresh_token,
            models: serde_json::from_str(&row.models)
                .map_err(|e| Error::Database(format!("channel models column: {}", e)))?,
            priority: row.priority,
            weight: row.weight,
            status: row
                .status
                .parse()
                .map_err(|e: String| Error::Database(e))?,
            request_count: row.request_count,
            success_count: row.success_count,
            failure_count: row.failure_count,
            consecutive_failures: row.consecutive_failures,
            last_used_at: row.last_used_at,
            last_failure_time: row.last_failure_time,
            circuit_breaker_until: row.circuit_breaker_until,
            rate_limited_until: row.rate_limited_until,
            created_at: row.created_at,
            updated_at: row.updated_at,
            transformers: serde_json::from_str(&row.transformers)
                .map_err(|e| Error::Database(format!("channel transformers column: {}", e)))?,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}
