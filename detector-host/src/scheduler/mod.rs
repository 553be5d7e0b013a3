//! Alert rule scheduling.

pub mod due;
pub mod executor;
pub mod service;

pub use due::{is_due, next_occurrence};
pub use executor::{ChildProcessRuleExecutor, RuleExecutor};
pub use service::{Scheduler, SchedulerConfig, TickReport};
