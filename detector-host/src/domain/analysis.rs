//! Requests and results exchanged with detectors.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::resource::ResourceIdentifier;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if self.end < self.start {
            return Err(Error::validation(format!(
                "time range ends ({}) before it starts ({})",
                self.end, self.start
            )));
        }
        Ok(())
    }
}

/// One analysis run of a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub detector_id: String,
    pub target_resources: BTreeSet<ResourceIdentifier>,
    pub time_range: TimeRange,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertSeverity {
    Informational,
    Low,
    Medium,
    High,
}

/// A finding produced by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub title: String,
    pub resource: ResourceIdentifier,
    pub severity: AlertSeverity,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Asks a detector whether a previously raised alert still holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionCheckRequest {
    pub detector_id: String,
    pub resource: ResourceIdentifier,
    #[serde(default)]
    pub alert_properties: Map<String, Value>,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionState {
    pub is_resolved: bool,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Request sent to a detector child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DetectorRunRequest {
    Analyze(AnalysisRequest),
    CheckResolution(ResolutionCheckRequest),
}

impl DetectorRunRequest {
    pub fn detector_id(&self) -> &str {
        match self {
            Self::Analyze(request) => &request.detector_id,
            Self::CheckResolution(request) => &request.detector_id,
        }
    }
}

/// Response returned by a detector child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DetectorRunResponse {
    Analyze { alerts: Vec<Alert> },
    CheckResolution(ResolutionState),
}
