//! Tee-destination rows

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

use super::Store;
use crate::error::{Error, Result};
use crate::models::{TeeDestination, TeeFilter, TeeKind};

#[derive(Debug, FromRow)]
struct TeeRow {
    id: String,
    name: String,
    kind: String,
    enabled: bool,
    url: Option<String>,
    method: Option<String>,
    headers: String,
    file_path: Option<String>,
    handler: Option<String>,
    filter: String,
    retries: i64,
    timeout_secs: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TeeRow> for TeeDestination {
    type Error = Error;

    fn try_from(row: TeeRow) -> Result<Self> {
        Ok(TeeDestination {
            id: row.id,
            name: row.name,
            kind: row.kind.parse().map_err(|e: String| Error::Database(e))?,
            enabled: row.enabled,
            url: row.url,
            method: row.method,
            headers: serde_json::from_str(&row.headers)
                .map_err(|e| Error::Database(format!("tee headers column: {}", e)))?,
            file_path: row.file_path,
            handler: row.handler,
            filter: serde_json::from_str(&row.filter)
                .map_err(|e| Error::Database(format!("tee filter column: {}", e)))?,
            retries: row.retries.max(0) as u32,
            timeout_secs: row.timeout_secs.max(0) as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Fields a tee destination is created or updated from
#[derive(Debug, Clone)]
pub struct NewTeeDestination {
    /// Unique name
    pub name: String,
    /// Destination kind
    pub kind: TeeKind,
    /// Whether the destination receives records
    pub enabled: bool,
    /// HTTP/webhook target URL
    pub url: Option<String>,
    /// HTTP method override
    pub method: Option<String>,
    /// Extra delivery headers
    pub headers: HashMap<String, String>,
    /// File path for file destinations
    pub file_path: Option<String>,
    /// Custom handler id
    pub handler: Option<String>,
    /// Record filter
    pub filter: TeeFilter,
    /// Maximum delivery attempts
    pub retries: u32,
    /// Per-attempt timeout in seconds
    pub timeout_secs: u64,
}

impl NewTeeDestination {
    fn validate(&self) -> Result<()> {
        match self.kind {
            TeeKind::Http | TeeKind::Webhook if self.url.is_none() => Err(Error::BadRequest(
                "http/webhook tee destinations require a url".to_string(),
            )),
            TeeKind::File if self.file_path.is_none() => Err(Error::BadRequest(
                "file tee destinations require a file_path".to_string(),
            )),
            TeeKind::Custom if self.handler.is_none() => Err(Error::BadRequest(
                "custom tee destinations require a handler id".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl Store {
    /// Insert a tee destination
    pub async fn create_tee(&self, new: NewTeeDestination) -> Result<TeeDestination> {
        new.validate()?;

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO tee_destinations
                (id, name, kind, enabled, url, method, headers, file_path,
                 handler, filter, retries, timeout_secs, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(new.kind.to_string())
        .bind(new.enabled)
        .bind(&new.url)
        .bind(&new.method)
        .bind(serde_json::to_string(&new.headers)?)
        .bind(&new.file_path)
        .bind(&new.handler)
        .bind(serde_json::to_string(&new.filter)?)
        .bind(new.retries as i64)
        .bind(new.timeout_secs as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.get_tee(&id).await,
            Err(e)
                if matches!(&e, sqlx::Error::Database(db)
                    if db.message().contains("UNIQUE constraint failed")) =>
            {
                Err(Error::Conflict(format!(
                    "tee destination '{}' already exists",
                    new.name
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch one destination by id
    pub async fn get_tee(&self, id: &str) -> Result<TeeDestination> {
        let row: TeeRow = sqlx::query_as("SELECT * FROM tee_destinations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("tee destination '{}'", id)))?;
        row.try_into()
    }

    /// All destinations, name order
    pub async fn list_tees(&self) -> Result<Vec<TeeDestination>> {
        let rows: Vec<TeeRow> = sqlx::query_as("SELECT * FROM tee_destinations ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Enabled destinations only
    pub async fn list_enabled_tees(&self) -> Result<Vec<TeeDestination>> {
        let rows: Vec<TeeRow> =
            sqlx::query_as("SELECT * FROM tee_destinations WHERE enabled = 1 ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Replace a destination's fields
    pub async fn update_tee(&self, id: &str, update: NewTeeDestination) -> Result<TeeDestination> {
        update.validate()?;

        let result = sqlx::query(
            r#"
            UPDATE tee_destinations SET
                name = ?, kind = ?, enabled = ?, url = ?, method = ?, headers = ?,
                file_path = ?, handler = ?, filter = ?, retries = ?, timeout_secs = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.name)
        .bind(update.kind.to_string())
        .bind(update.enabled)
        .bind(&update.url)
        .bind(&update.method)
        .bind(serde_json::to_string(&update.headers)?)
        .bind(&update.file_path)
        .bind(&update.handler)
        .bind(serde_json::to_string(&update.filter)?)
        .bind(update.retries as i64)
        .bind(update.timeout_secs as i64)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("tee destination '{}'", id)));
        }
        self.get_tee(id).await
    }

    /// Delete a destination by id
    pub async fn delete_tee(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM tee_destinations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("tee destination '{}'", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_tee(name: &str) -> NewTeeDestination {
        NewTeeDestination {
            name: name.to_string(),
            kind: TeeKind::Http,
            enabled: true,
            url: Some("http://127.0.0.1:9999/sink".to_string()),
            method: Some("POST".to_string()),
            headers: HashMap::new(),
            file_path: None,
            handler: None,
            filter: TeeFilter::default(),
            retries: 3,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_crud_round_trip() {
        let store = Store::connect_memory().await.unwrap();
        let created = store.create_tee(http_tee("audit")).await.unwrap();
        assert_eq!(created.kind, TeeKind::Http);

        let mut update = http_tee("audit");
        update.enabled = false;
        update.retries = 1;
        let updated = store.update_tee(&created.id, update).await.unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.retries, 1);

        assert_eq!(store.list_enabled_tees().await.unwrap().len(), 0);
        store.delete_tee(&created.id).await.unwrap();
        assert!(store.list_tees().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kind_field_validation() {
        let store = Store::connect_memory().await.unwrap();

        let mut no_url = http_tee("bad");
        no_url.url = None;
        assert!(matches!(
            store.create_tee(no_url).await,
            Err(Error::BadRequest(_))
        ));

        let mut file_sink = http_tee("file");
        file_sink.kind = TeeKind::File;
        file_sink.url = None;
        assert!(matches!(
            store.create_tee(file_sink.clone()).await,
            Err(Error::BadRequest(_))
        ));
        file_sink.file_path = Some("/tmp/tee.jsonl".to_string());
        assert!(store.create_tee(file_sink).await.is_ok());
    }
}
