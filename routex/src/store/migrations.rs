//! Monotonic schema migrations keyed by `PRAGMA user_version`
//!
//! Each entry runs inside one transaction together with the version bump, so
//! a partially applied migration cannot be observed. Statements are written
//! to be idempotent (`IF NOT EXISTS`) as a second line of defense.

use sqlx::SqlitePool;

use crate::error::{Error, Result};

/// Ordered migration batches; index 0 brings the schema to version 1
const MIGRATIONS: &[&str] = &[
    // v1: core entities
    r#"
    CREATE TABLE IF NOT EXISTS channels (
        id                    TEXT PRIMARY KEY,
        name                  TEXT NOT NULL UNIQUE,
        vendor                TEXT NOT NULL,
        base_url              TEXT,
        api_key               TEXT,
        refresh_token         TEXT,
        models                TEXT NOT NULL DEFAULT '[]',
        priority              INTEGER NOT NULL DEFAULT 0,
        weight                INTEGER NOT NULL DEFAULT 1 CHECK (weight >= 1),
        status                TEXT NOT NULL DEFAULT 'enabled',
        request_count         INTEGER NOT NULL DEFAULT 0,
        success_count         INTEGER NOT NULL DEFAULT 0,
        failure_count         INTEGER NOT NULL DEFAULT 0,
        consecutive_failures  INTEGER NOT NULL DEFAULT 0,
        last_used_at          TEXT,
        last_failure_time     TEXT,
        circuit_breaker_until TEXT,
        rate_limited_until    TEXT,
        created_at            TEXT NOT NULL,
        updated_at            TEXT NOT NULL,
        transformers          TEXT NOT NULL DEFAULT '[]'
    );
    CREATE INDEX IF NOT EXISTS idx_channels_status ON channels (status);
    CREATE INDEX IF NOT EXISTS idx_channels_priority ON channels (priority DESC);

    CREATE TABLE IF NOT EXISTS routing_rules (
        id             TEXT PRIMARY KEY,
        name           TEXT NOT NULL,
        condition      TEXT NOT NULL,
        target_channel TEXT NOT NULL,
        target_model   TEXT,
        priority       INTEGER NOT NULL DEFAULT 0,
        enabled        INTEGER NOT NULL DEFAULT 1,
        created_at     TEXT NOT NULL,
        updated_at     TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_routing_rules_priority ON routing_rules (priority DESC);

    CREATE TABLE IF NOT EXISTS tee_destinations (
        id           TEXT PRIMARY KEY,
        name         TEXT NOT NULL UNIQUE,
        kind         TEXT NOT NULL,
        enabled      INTEGER NOT NULL DEFAULT 1,
        url          TEXT,
        method       TEXT,
        headers      TEXT NOT NULL DEFAULT '{}',
        file_path    TEXT,
        handler      TEXT,
        filter       TEXT NOT NULL DEFAULT '{}',
        retries      INTEGER NOT NULL DEFAULT 3,
        timeout_secs INTEGER NOT NULL DEFAULT 5,
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS oauth_sessions (
        id            TEXT PRIMARY KEY,
        channel_id    TEXT,
        provider      TEXT NOT NULL,
        access_token  TEXT NOT NULL,
        refresh_token TEXT,
        expires_at    TEXT NOT NULL,
        scopes        TEXT NOT NULL DEFAULT '[]',
        user_info     TEXT,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS request_logs (
        id            TEXT PRIMARY KEY,
        channel_id    TEXT,
        model         TEXT NOT NULL,
        method        TEXT NOT NULL,
        path          TEXT NOT NULL,
        status_code   INTEGER NOT NULL,
        latency_ms    INTEGER NOT NULL,
        input_tokens  INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        cached_tokens INTEGER NOT NULL DEFAULT 0,
        success       INTEGER NOT NULL,
        error         TEXT,
        timestamp     TEXT NOT NULL,
        trace_id      TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp ON request_logs (timestamp);
    CREATE INDEX IF NOT EXISTS idx_request_logs_channel ON request_logs (channel_id);
    "#,
];

/// Bring the schema up to the latest version; failure is fatal at boot
pub async fn run(pool: &SqlitePool) -> Result<()> {
    let current: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| Error::Database(format!("reading schema version: {}", e)))?;

    let target = MIGRATIONS.len() as i64;
    if current > target {
        return Err(Error::Database(format!(
            "database schema version {} is newer than this binary supports ({})",
            current, target
        )));
    }

    for (index, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = index as i64 + 1;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("migration {}: begin: {}", version, e)))?;

        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("migration {} failed: {}", version, e)))?;

        sqlx::raw_sql(&format!("PRAGMA user_version = {}", version))
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("migration {}: version bump: {}", version, e)))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("migration {}: commit: {}", version, e)))?;

        tracing::info!("applied schema migration v{}", version);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = Store::connect_memory().await.unwrap();
        // A second run over an up-to-date schema is a no-op
        run(store.pool()).await.unwrap();
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }
}
