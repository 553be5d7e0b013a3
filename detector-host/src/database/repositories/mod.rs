//! Repository layer for database access.

pub mod alert_rule;
pub mod memory;

pub use alert_rule::{AlertRuleStore, SqlxAlertRuleStore};
pub use memory::InMemoryAlertRuleStore;
