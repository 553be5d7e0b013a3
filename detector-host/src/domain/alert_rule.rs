//! Alert rules: a detector bound to a schedule and a set of resources.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::resource::{ResourceIdentifier, ResourceType};
use crate::{Error, Result};

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    /// Signal id of the detector the rule runs.
    #[serde(alias = "signal_id")]
    pub detector_id: String,
    pub resource_type: ResourceType,
    pub cron_schedule: String,
    #[serde(default)]
    pub target_resources: BTreeSet<ResourceIdentifier>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        detector_id: impl Into<String>,
        resource_type: ResourceType,
        cron_schedule: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            detector_id: detector_id.into(),
            resource_type,
            cron_schedule: cron_schedule.into(),
            target_resources: BTreeSet::new(),
            settings: Map::new(),
            enabled: true,
        }
    }

    pub fn with_target(mut self, resource: ResourceIdentifier) -> Self {
        self.target_resources.insert(resource);
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn schedule(&self) -> Result<Schedule> {
        parse_schedule(&self.cron_schedule)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("alert rule id must not be empty"));
        }
        if self.detector_id.trim().is_empty() {
            return Err(Error::validation("alert rule detector_id must not be empty"));
        }
        self.schedule()?;
        for resource in &self.target_resources {
            resource.validate()?;
            if resource.resource_type != self.resource_type {
                return Err(Error::validation(format!(
                    "target {} is a {}, rule expects {}",
                    resource, resource.resource_type, self.resource_type
                )));
            }
        }
        Ok(())
    }
}

/// Parse a cron expression.
///
/// Five-field expressions (minute granularity) get a leading seconds field.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::validation(format!("invalid cron expression '{expression}': {e}")))
}

/// Per-rule bookkeeping kept by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionState {
    pub last_execution_time: Option<DateTime<Utc>>,
    /// Consecutive ticks that ended with an exhausted retriable failure.
    pub consecutive_deferrals: u32,
}
