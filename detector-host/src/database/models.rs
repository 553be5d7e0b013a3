//! Row types.

use std::str::FromStr;

use sqlx::FromRow;

use super::time::{datetime_to_ms, ms_to_datetime, now_ms};
use crate::domain::{AlertRule, ResourceType};
use crate::{Error, Result};

/// Row of `alert_rules`. JSON columns are kept as text.
#[derive(Debug, Clone, FromRow)]
pub struct AlertRuleDbModel {
    pub id: String,
    pub detector_id: String,
    pub resource_type: String,
    pub cron_schedule: String,
    pub target_resources: String,
    pub settings: String,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AlertRuleDbModel {
    pub fn from_rule(rule: &AlertRule) -> Result<Self> {
        let now = now_ms();
        Ok(Self {
            id: rule.id.clone(),
            detector_id: rule.detector_id.clone(),
            resource_type: rule.resource_type.to_string(),
            cron_schedule: rule.cron_schedule.clone(),
            target_resources: serde_json::to_string(&rule.target_resources)?,
            settings: serde_json::to_string(&rule.settings)?,
            enabled: rule.enabled,
            created_at: now,
            updated_at: now,
        })
    }
}

impl TryFrom<AlertRuleDbModel> for AlertRule {
    type Error = Error;

    fn try_from(row: AlertRuleDbModel) -> Result<Self> {
        let resource_type = ResourceType::from_str(&row.resource_type).map_err(|_| {
            Error::Database(format!(
                "alert rule {} has unknown resource type '{}'",
                row.id, row.resource_type
            ))
        })?;
        Ok(Self {
            id: row.id,
            detector_id: row.detector_id,
            resource_type,
            cron_schedule: row.cron_schedule,
            target_resources: serde_json::from_str(&row.target_resources)?,
            settings: serde_json::from_str(&row.settings)?,
            enabled: row.enabled,
        })
    }
}

/// Row of `rule_execution_state`.
#[derive(Debug, Clone, FromRow)]
pub struct RuleExecutionDbModel {
    pub rule_id: String,
    pub last_execution_time: i64,
}

impl RuleExecutionDbModel {
    pub fn last_execution_time(&self) -> chrono::DateTime<chrono::Utc> {
        ms_to_datetime(self.last_execution_time)
    }

    pub fn new(rule_id: impl Into<String>, at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            rule_id: rule_id.into(),
            last_execution_time: datetime_to_ms(at),
        }
    }
}
