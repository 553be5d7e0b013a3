//! Alert rule store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::{AlertRuleDbModel, RuleExecutionDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::domain::AlertRule;
use crate::{Error, Result};

/// Management store for alert rules and their last execution time.
#[async_trait]
pub trait AlertRuleStore: Send + Sync {
    async fn get_all_alert_rules(&self) -> Result<Vec<AlertRule>>;
    async fn get_alert_rule(&self, id: &str) -> Result<AlertRule>;
    /// Insert or overwrite a rule. The rule's execution state is kept.
    async fn add_or_replace_alert_rule(&self, rule: &AlertRule) -> Result<()>;
    /// Delete a rule together with its execution state.
    async fn delete_alert_rule(&self, id: &str) -> Result<()>;
    async fn get_last_execution_time(&self, rule_id: &str) -> Result<Option<DateTime<Utc>>>;
    /// Fails with `NotFound` when the rule does not exist.
    async fn set_last_execution_time(&self, rule_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// SQLx implementation of AlertRuleStore.
pub struct SqlxAlertRuleStore {
    pool: SqlitePool,
}

impl SqlxAlertRuleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertRuleStore for SqlxAlertRuleStore {
    async fn get_all_alert_rules(&self) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query_as::<_, AlertRuleDbModel>("SELECT * FROM alert_rules ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(AlertRule::try_from).collect()
    }

    async fn get_alert_rule(&self, id: &str) -> Result<AlertRule> {
        sqlx::query_as::<_, AlertRuleDbModel>("SELECT * FROM alert_rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("AlertRule", id))?
            .try_into()
    }

    async fn add_or_replace_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        rule.validate()?;
        let row = AlertRuleDbModel::from_rule(rule)?;

        retry_on_sqlite_busy("add_or_replace_alert_rule", || async {
            sqlx::query(
                r#"
                INSERT INTO alert_rules (
                    id, detector_id, resource_type, cron_schedule,
                    target_resources, settings, enabled, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    detector_id = excluded.detector_id,
                    resource_type = excluded.resource_type,
                    cron_schedule = excluded.cron_schedule,
                    target_resources = excluded.target_resources,
                    settings = excluded.settings,
                    enabled = excluded.enabled,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&row.id)
            .bind(&row.detector_id)
            .bind(&row.resource_type)
            .bind(&row.cron_schedule)
            .bind(&row.target_resources)
            .bind(&row.settings)
            .bind(row.enabled)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn delete_alert_rule(&self, id: &str) -> Result<()> {
        let result = retry_on_sqlite_busy("delete_alert_rule", || async {
            Ok(sqlx::query("DELETE FROM alert_rules WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("AlertRule", id));
        }
        Ok(())
    }

    async fn get_last_execution_time(&self, rule_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query_as::<_, RuleExecutionDbModel>(
            "SELECT rule_id, last_execution_time FROM rule_execution_state WHERE rule_id = ?",
        )
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.last_execution_time()))
    }

    async fn set_last_execution_time(&self, rule_id: &str, at: DateTime<Utc>) -> Result<()> {
        let row = RuleExecutionDbModel::new(rule_id, at);

        // Selecting from alert_rules turns an unknown rule into zero affected rows.
        let result = retry_on_sqlite_busy("set_last_execution_time", || async {
            Ok(sqlx::query(
                r#"
                INSERT INTO rule_execution_state (rule_id, last_execution_time, updated_at)
                SELECT id, ?, ? FROM alert_rules WHERE id = ?
                ON CONFLICT(rule_id) DO UPDATE SET
                    last_execution_time = excluded.last_execution_time,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(row.last_execution_time)
            .bind(now_ms())
            .bind(&row.rule_id)
            .execute(&self.pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("AlertRule", rule_id));
        }
        Ok(())
    }
}
