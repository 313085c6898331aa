//! SQLite-backed persistent store
//!
//! One pool, one typed facade. Channel credentials are encrypted before any
//! row is written and decrypted on read; plaintext never reaches the disk.
//! Request logs go through an in-memory buffer with a background flusher so
//! the hot path never blocks on fsync.

mod channels;
mod logs;
mod migrations;
mod rules;
mod sessions;
mod tee;

pub use channels::{ChannelRuntime, NewChannel};
pub use logs::{AnalyticsSummary, LogBuffer, ModelUsage, RequestLogFilter, RequestLogPage};
pub use rules::NewRoutingRule;
pub use sessions::NewOAuthSession;
pub use tee::NewTeeDestination;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DatabaseConfig, PricingConfig};
use crate::crypto::CredentialCipher;
use crate::error::{Error, Result};

/// Typed facade over the SQLite store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    cipher: CredentialCipher,
    pricing: PricingConfig,
    log_buffer: Arc<LogBuffer>,
}

impl Store {
    /// Open the pool, run migrations, and start the log flusher
    pub async fn connect(
        config: &DatabaseConfig,
        cipher: CredentialCipher,
        pricing: PricingConfig,
    ) -> Result<Self> {
        let pool = create_pool_with_retries(config).await?;
        migrations::run(&pool).await?;

        let log_buffer = Arc::new(LogBuffer::new(
            config.log_batch_size,
            Duration::from_millis(config.log_flush_interval_ms),
        ));

        let store = Self {
            pool,
            cipher,
            pricing,
            log_buffer,
        };
        store.log_buffer.clone().spawn_flusher(store.clone());

        Ok(store)
    }

    /// Open an isolated in-memory store (tests)
    #[cfg(test)]
    pub async fn connect_memory() -> Result<Self> {
        let mut config = DatabaseConfig::default();
        config.path = ":memory:".to_string();
        let cipher = CredentialCipher::new(&"m".repeat(32), None)?;
        Self::connect(&config, cipher, PricingConfig::default()).await
    }

    /// Connection pool handle
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Credential cipher in use
    pub fn cipher(&self) -> &CredentialCipher {
        &self.cipher
    }

    /// Pricing table used by analytics
    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    /// Request-log buffer handle
    pub fn log_buffer(&self) -> &Arc<LogBuffer> {
        &self.log_buffer
    }

    /// Flush buffered request logs and close the pool
    pub async fn shutdown(&self) {
        if let Err(e) = self.log_buffer.flush_now(self).await {
            tracing::error!("final request-log flush failed: {}", e);
        }
        self.pool.close().await;
    }
}

/// Create the SQLite pool with retry and exponential backoff
async fn create_pool_with_retries(config: &DatabaseConfig) -> Result<SqlitePool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!("database opened after {} attempt(s)", attempt + 1);
                } else {
                    tracing::info!(
                        path = %config.path,
                        max_connections = config.max_connections,
                        "database pool created"
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::error!(
                        "failed to open database after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "database open attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Attempt to create the pool (single try)
async fn try_create_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let in_memory = config.path == ":memory:";

    let mut options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.path))
        .map_err(|e| Error::Config(format!("invalid database path '{}': {}", config.path, e)))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .pragma("cache_size", config.cache_size.to_string())
        .pragma("mmap_size", config.mmap_size.to_string())
        .pragma("foreign_keys", "ON");

    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // A shared in-memory database needs a single connection; separate
    // connections would each see their own empty database.
    let max_connections = if in_memory { 1 } else { config.max_connections };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|e| Error::Database(format!("failed to open '{}': {}", config.path, e)))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory_runs_migrations() {
        let store = Store::connect_memory().await.unwrap();
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(version >= 1);
    }
}
