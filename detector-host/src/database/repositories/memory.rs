//! Process-local alert rule store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::alert_rule::AlertRuleStore;
use crate::domain::AlertRule;
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    rules: BTreeMap<String, AlertRule>,
    last_execution: HashMap<String, DateTime<Utc>>,
}

/// Keeps rules in memory with the same semantics as the SQLite store.
#[derive(Default)]
pub struct InMemoryAlertRuleStore {
    inner: RwLock<Inner>,
}

impl InMemoryAlertRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = AlertRule>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write();
            for rule in rules {
                inner.rules.insert(rule.id.clone(), rule);
            }
        }
        store
    }
}

#[async_trait]
impl AlertRuleStore for InMemoryAlertRuleStore {
    async fn get_all_alert_rules(&self) -> Result<Vec<AlertRule>> {
        Ok(self.inner.read().rules.values().cloned().collect())
    }

    async fn get_alert_rule(&self, id: &str) -> Result<AlertRule> {
        self.inner
            .read()
            .rules
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("AlertRule", id))
    }

    async fn add_or_replace_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        rule.validate()?;
        self.inner.write().rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn delete_alert_rule(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.rules.remove(id).is_none() {
            return Err(Error::not_found("AlertRule", id));
        }
        inner.last_execution.remove(id);
        Ok(())
    }

    async fn get_last_execution_time(&self, rule_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.read().last_execution.get(rule_id).copied())
    }

    async fn set_last_execution_time(&self, rule_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.rules.contains_key(rule_id) {
            return Err(Error::not_found("AlertRule", rule_id));
        }
        inner.last_execution.insert(rule_id.to_string(), at);
        Ok(())
    }
}
