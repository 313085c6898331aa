//! Routing-rule rows

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Store;
use crate::error::{Error, Result};
use crate::models::{RoutingRule, RuleCondition};

#[derive(Debug, FromRow)]
struct RuleRow {
    id: String,
    name: String,
    condition: String,
    target_channel: String,
    target_model: Option<String>,
    priority: i64,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RuleRow> for RoutingRule {
    type Error = Error;

    fn try_from(row: RuleRow) -> Result<Self> {
        Ok(RoutingRule {
            id: row.id,
            name: row.name,
            condition: serde_json::from_str(&row.condition)
                .map_err(|e| Error::Database(format!("rule condition column: {}", e)))?,
            target_channel: row.target_channel,
            target_model: row.target_model,
            priority: row.priority,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Fields a routing rule is created or updated from
#[derive(Debug, Clone)]
pub struct NewRoutingRule {
    /// Display name and tie-break key
    pub name: String,
    /// Match predicate
    pub condition: RuleCondition,
    /// Target channel name or `*`
    pub target_channel: String,
    /// Optional model override
    pub target_model: Option<String>,
    /// Evaluation priority
    pub priority: i64,
    /// Whether the rule may fire
    pub enabled: bool,
}

impl Store {
    /// Insert a routing rule
    pub async fn create_rule(&self, new: NewRoutingRule) -> Result<RoutingRule> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO routing_rules
                (id, name, condition, target_channel, target_model, priority,
                 enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(serde_json::to_string(&new.condition)?)
        .bind(&new.target_channel)
        .bind(&new.target_model)
        .bind(new.priority)
        .bind(new.enabled)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_rule(&id).await
    }

    /// Fetch one rule by id
    pub async fn get_rule(&self, id: &str) -> Result<RoutingRule> {
        let row: RuleRow = sqlx::query_as("SELECT * FROM routing_rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("routing rule '{}'", id)))?;
        row.try_into()
    }

    /// All rules, effective evaluation order
    pub async fn list_rules(&self) -> Result<Vec<RoutingRule>> {
        let rows: Vec<RuleRow> =
            sqlx::query_as("SELECT * FROM routing_rules ORDER BY priority DESC, name ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Enabled rules only, effective evaluation order
    pub async fn list_enabled_rules(&self) -> Result<Vec<RoutingRule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT * FROM routing_rules WHERE enabled = 1 ORDER BY priority DESC, name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Replace a rule's fields
    pub async fn update_rule(&self, id: &str, update: NewRoutingRule) -> Result<RoutingRule> {
        let result = sqlx::query(
            r#"
            UPDATE routing_rules SET
                name = ?, condition = ?, target_channel = ?, target_model = ?,
                priority = ?, enabled = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.name)
        .bind(serde_json::to_string(&update.condition)?)
        .bind(&update.target_channel)
        .bind(&update.target_model)
        .bind(update.priority)
        .bind(update.enabled)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("routing rule '{}'", id)));
        }
        self.get_rule(id).await
    }

    /// Delete a rule by id
    pub async fn delete_rule(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM routing_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("routing rule '{}'", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ANY_CHANNEL;

    fn rule(name: &str, priority: i64, enabled: bool) -> NewRoutingRule {
        NewRoutingRule {
            name: name.to_string(),
            condition: RuleCondition::ModelEquals {
                model: "claude-opus-4".to_string(),
            },
            target_channel: ANY_CHANNEL.to_string(),
            target_model: None,
            priority,
            enabled,
        }
    }

    #[tokio::test]
    async fn test_effective_order() {
        let store = Store::connect_memory().await.unwrap();
        store.create_rule(rule("b-low", 1, true)).await.unwrap();
        store.create_rule(rule("z-high", 100, true)).await.unwrap();
        store.create_rule(rule("a-high", 100, true)).await.unwrap();
        store.create_rule(rule("disabled", 500, false)).await.unwrap();

        let enabled = store.list_enabled_rules().await.unwrap();
        let names: Vec<&str> = enabled.iter().map(|r| r.name.as_str()).collect();
        // Priority desc, then name asc; disabled rules absent
        assert_eq!(names, vec!["a-high", "z-high", "b-low"]);
    }

    #[tokio::test]
    async fn test_condition_round_trips() {
        let store = Store::connect_memory().await.unwrap();
        let mut new = rule("header", 5, true);
        new.condition = RuleCondition::HeaderEquals {
            name: "x-team".to_string(),
            value: "research".to_string(),
        };
        let created = store.create_rule(new).await.unwrap();
        let read = store.get_rule(&created.id).await.unwrap();
        assert_eq!(
            read.condition,
            RuleCondition::HeaderEquals {
                name: "x-team".to_string(),
                value: "research".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = Store::connect_memory().await.unwrap();
        let created = store.create_rule(rule("r", 1, true)).await.unwrap();

        let mut update = rule("r", 9, false);
        update.target_model = Some("claude-sonnet-4".to_string());
        let updated = store.update_rule(&created.id, update).await.unwrap();
        assert_eq!(updated.priority, 9);
        assert!(!updated.enabled);

        store.delete_rule(&created.id).await.unwrap();
        assert!(matches!(
            store.get_rule(&created.id).await,
            Err(Error::NotFound(_))
        ));
    }
}
