//! Child-side execution of detector requests.
//!
//! Everything a detector does wrong ends up as a [`FailureDescriptor`] here, so the
//! host only ever sees typed outcomes.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use child_process::{FailureDescriptor, HandlerError, panic_message};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::detectors::{DetectorError, DetectorHandle, DetectorLoader, DetectorServices, LoaderError};
use crate::domain::{
    Alert, AnalysisRequest, DetectorRunRequest, DetectorRunResponse, ResolutionCheckRequest,
    ResolutionState, ResourceIdentifier,
};
use crate::resilience::{DependencyTracer, LogDependencyTracer};

pub struct DetectorRunner {
    loader: Arc<dyn DetectorLoader>,
    tracer: Arc<dyn DependencyTracer>,
}

impl DetectorRunner {
    pub fn new(loader: Arc<dyn DetectorLoader>) -> Self {
        Self {
            loader,
            tracer: Arc::new(LogDependencyTracer),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn DependencyTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Dispatch a wire request to the matching operation.
    pub async fn handle(
        &self,
        request: DetectorRunRequest,
        cancel: CancellationToken,
    ) -> Result<DetectorRunResponse, HandlerError> {
        match request {
            DetectorRunRequest::Analyze(request) => self
                .analyze(&request, &cancel)
                .await
                .map(|alerts| DetectorRunResponse::Analyze { alerts }),
            DetectorRunRequest::CheckResolution(request) => self
                .check_resolution(&request, &cancel)
                .await
                .map(DetectorRunResponse::CheckResolution),
        }
    }

    pub async fn analyze(
        &self,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>, HandlerError> {
        let handle = self.resolve(&request.detector_id)?;
        request
            .time_range
            .validate()
            .map_err(|e| FailureDescriptor::generic(e.to_string()))?;
        check_compatible(&handle, request.target_resources.iter())?;

        let resources: Vec<ResourceIdentifier> = request.target_resources.iter().cloned().collect();
        let services = self.services(&handle, &request.settings);
        debug!(
            detector_id = %request.detector_id,
            resources = resources.len(),
            "Running analysis"
        );

        let detector = handle.detector.clone();
        invoke(
            cancel,
            detector.analyze(&resources, &request.time_range, &services, cancel),
        )
        .await
    }

    pub async fn check_resolution(
        &self,
        request: &ResolutionCheckRequest,
        cancel: &CancellationToken,
    ) -> Result<ResolutionState, HandlerError> {
        let handle = self.resolve(&request.detector_id)?;
        check_compatible(&handle, std::iter::once(&request.resource))?;

        let services = self.services(&handle, &request.settings);
        debug!(
            detector_id = %request.detector_id,
            resource = %request.resource,
            "Checking resolution"
        );

        let detector = handle.detector.clone();
        invoke(cancel, detector.check_resolution(request, &services, cancel)).await
    }

    fn resolve(&self, detector_id: &str) -> Result<DetectorHandle, FailureDescriptor> {
        self.loader.resolve(detector_id).map_err(|e| match e {
            LoaderError::NotFound(_) => FailureDescriptor::not_found(e.to_string()),
            LoaderError::Load(_) => FailureDescriptor::load_failure(e.to_string()),
        })
    }

    fn services(
        &self,
        handle: &DetectorHandle,
        overrides: &serde_json::Map<String, serde_json::Value>,
    ) -> DetectorServices {
        DetectorServices::new(handle.merged_settings(overrides)).with_tracer(self.tracer.clone())
    }
}

fn check_compatible<'a>(
    handle: &DetectorHandle,
    mut resources: impl Iterator<Item = &'a ResourceIdentifier>,
) -> Result<(), FailureDescriptor> {
    let supported = handle.detector.supported_resource_type();
    match resources.find(|r| r.resource_type != supported) {
        Some(resource) => Err(FailureDescriptor::incompatible(format!(
            "detector '{}' supports {supported} resources, got {} ({resource})",
            handle.detector.id(),
            resource.resource_type
        ))),
        None => Ok(()),
    }
}

/// Run a detector call, mapping its failures and panics.
///
/// A detector that observes cancellation is awaited until it returns, so its cleanup
/// runs; one that ignores it is killed by the host after the grace period. Whatever
/// a call produces once cancellation was requested is reported as cancelled.
async fn invoke<T, F>(cancel: &CancellationToken, call: F) -> Result<T, HandlerError>
where
    F: Future<Output = Result<T, DetectorError>>,
{
    if cancel.is_cancelled() {
        return Err(HandlerError::Cancelled);
    }

    let outcome = AssertUnwindSafe(call).catch_unwind().await;
    if cancel.is_cancelled() {
        debug!("Detector returned after cancellation");
        return Err(HandlerError::Cancelled);
    }

    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(DetectorError::Cancelled)) => Err(HandlerError::Cancelled),
        Ok(Err(DetectorError::Transient(message))) => {
            warn!("Detector dependency failed: {message}");
            Err(FailureDescriptor::transient(message).into())
        }
        Ok(Err(DetectorError::Fault(message))) => Err(FailureDescriptor::generic(message).into()),
        Err(panic) => Err(FailureDescriptor::generic(panic_message(panic.as_ref())).into()),
    }
}
