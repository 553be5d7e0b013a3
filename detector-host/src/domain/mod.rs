//! Domain model.

pub mod alert_rule;
pub mod analysis;
pub mod resource;

pub use alert_rule::{AlertRule, ExecutionState, parse_schedule};
pub use analysis::{
    Alert, AlertSeverity, AnalysisRequest, DetectorRunRequest, DetectorRunResponse,
    ResolutionCheckRequest, ResolutionState, TimeRange,
};
pub use resource::{ResourceIdentifier, ResourceType};
