//! Detector capability interface.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    Alert, ResolutionCheckRequest, ResolutionState, ResourceIdentifier, ResourceType, TimeRange,
};
use crate::resilience::{DependencyTracer, LogDependencyTracer};

/// How a detector call can fail.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectorError {
    /// A dependency failed in a way that may succeed later.
    #[error("{0}")]
    Transient(String),
    /// Any other fault.
    #[error("{0}")]
    Fault(String),
    /// The detector observed cancellation and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl DetectorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fault(msg: impl Into<String>) -> Self {
        Self::Fault(msg.into())
    }
}

/// Collaborators handed to a detector for one call.
#[derive(Clone)]
pub struct DetectorServices {
    /// Package defaults overlaid with the request's own settings.
    pub settings: Map<String, Value>,
    pub tracer: Arc<dyn DependencyTracer>,
}

impl DetectorServices {
    pub fn new(settings: Map<String, Value>) -> Self {
        Self {
            settings,
            tracer: Arc::new(LogDependencyTracer),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn DependencyTracer>) -> Self {
        self.tracer = tracer;
        self
    }
}

impl std::fmt::Debug for DetectorServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorServices")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Signal id of the detector.
    fn id(&self) -> &str;

    /// The only resource type the detector accepts.
    fn supported_resource_type(&self) -> ResourceType;

    async fn analyze(
        &self,
        resources: &[ResourceIdentifier],
        time_range: &TimeRange,
        services: &DetectorServices,
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>, DetectorError>;

    async fn check_resolution(
        &self,
        request: &ResolutionCheckRequest,
        services: &DetectorServices,
        cancel: &CancellationToken,
    ) -> Result<ResolutionState, DetectorError>;
}
