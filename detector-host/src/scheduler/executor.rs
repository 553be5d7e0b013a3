//! Runs one analysis on behalf of the scheduler.

use async_trait::async_trait;
use child_process::{ChildProcessError, ChildProcessManager};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{
    Alert, AnalysisRequest, DetectorRunRequest, DetectorRunResponse, ResolutionCheckRequest,
    ResolutionState,
};

#[async_trait]
pub trait RuleExecutor: Send + Sync {
    async fn execute(
        &self,
        request: AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<Alert>, ChildProcessError>;
}

/// Executes every request in its own detector child process.
pub struct ChildProcessRuleExecutor {
    manager: ChildProcessManager,
}

impl ChildProcessRuleExecutor {
    pub fn new(manager: ChildProcessManager) -> Self {
        Self { manager }
    }

    async fn dispatch(
        &self,
        request: DetectorRunRequest,
        cancel: &CancellationToken,
    ) -> Result<DetectorRunResponse, ChildProcessError> {
        let (result, report) = self
            .manager
            .run_with_report::<_, DetectorRunResponse>(&request, cancel)
            .await;
        debug!(
            detector_id = %request.detector_id(),
            correlation_id = %report.correlation_id,
            pid = ?report.pid,
            state = %report.final_state,
            exit_code = ?report.exit_code,
            heartbeats = report.heartbeats,
            duration_ms = report.duration.as_millis() as u64,
            "Detector child process finished"
        );
        result
    }

    /// Ask a detector whether an alert it raised still holds.
    pub async fn check_resolution(
        &self,
        request: ResolutionCheckRequest,
        cancel: &CancellationToken,
    ) -> Result<ResolutionState, ChildProcessError> {
        match self
            .dispatch(DetectorRunRequest::CheckResolution(request), cancel)
            .await?
        {
            DetectorRunResponse::CheckResolution(state) => Ok(state),
            DetectorRunResponse::Analyze { .. } => Err(ChildProcessError::protocol(
                "expected a resolution state, got analysis alerts",
            )),
        }
    }
}

#[async_trait]
impl RuleExecutor for ChildProcessRuleExecutor {
    async fn execute(
        &self,
        request: AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<Alert>, ChildProcessError> {
        match self
            .dispatch(DetectorRunRequest::Analyze(request), &cancel)
            .await?
        {
            DetectorRunResponse::Analyze { alerts } => Ok(alerts),
            DetectorRunResponse::CheckResolution(_) => Err(ChildProcessError::protocol(
                "expected analysis alerts, got a resolution state",
            )),
        }
    }
}
