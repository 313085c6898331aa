//! OAuth session rows
//!
//! The core treats sessions as a read-only credential source with an absolute
//! expiry; it never refreshes them on the hot path.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Store;
use crate::error::{Error, Result};
use crate::models::OAuthSession;

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    channel_id: Option<String>,
    provider: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
    scopes: String,
    user_info: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for OAuthSession {
    type Error = Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(OAuthSession {
            id: row.id,
            channel_id: row.channel_id,
            provider: row.provider,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            expires_at: row.expires_at,
            scopes: serde_json::from_str(&row.scopes)
                .map_err(|e| Error::Database(format!("session scopes column: {}", e)))?,
            user_info: row
                .user_info
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|e| Error::Database(format!("session user_info column: {}", e)))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Fields a session is created from
#[derive(Debug, Clone)]
pub struct NewOAuthSession {
    /// Channel binding, when any
    pub channel_id: Option<String>,
    /// Provider tag
    pub provider: String,
    /// Access token
    pub access_token: String,
    /// Refresh token
    pub refresh_token: Option<String>,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Provider user info payload
    pub user_info: Option<serde_json::Value>,
}

impl Store {
    /// Insert a session
    pub async fn create_session(&self, new: NewOAuthSession) -> Result<OAuthSession> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO oauth_sessions
                (id, channel_id, provider, access_token, refresh_token,
                 expires_at, scopes, user_info, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.channel_id)
        .bind(&new.provider)
        .bind(&new.access_token)
        .bind(&new.refresh_token)
        .bind(new.expires_at)
        .bind(serde_json::to_string(&new.scopes)?)
        .bind(
            new.user_info
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_session(&id).await
    }

    /// Fetch one session by id
    pub async fn get_session(&self, id: &str) -> Result<OAuthSession> {
        let row: SessionRow = sqlx::query_as("SELECT * FROM oauth_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("oauth session '{}'", id)))?;
        row.try_into()
    }

    /// All sessions, newest first
    pub async fn list_sessions(&self) -> Result<Vec<OAuthSession>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM oauth_sessions ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Delete a session by id
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM oauth_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("oauth session '{}'", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_session_round_trip_and_expiry() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();

        let session = store
            .create_session(NewOAuthSession {
                channel_id: None,
                provider: "anthropic".to_string(),
                access_token: "tok-123".to_string(),
                refresh_token: Some("refresh-456".to_string()),
                expires_at: now + Duration::hours(1),
                scopes: vec!["inference".to_string()],
                user_info: Some(serde_json::json!({"email": "dev@example.com"})),
            })
            .await
            .unwrap();

        let read = store.get_session(&session.id).await.unwrap();
        assert_eq!(read.provider, "anthropic");
        assert_eq!(read.scopes, vec!["inference".to_string()]);
        assert!(!read.is_expired(now));
        assert!(read.is_expired(now + Duration::hours(2)));

        store.delete_session(&session.id).await.unwrap();
        assert!(store.list_sessions().await.unwrap().is_empty());
    }
}
