//! Host side of a child invocation.
//!
//! [`ChildProcessManager::run_child_process`] launches one child, delivers the
//! request and drives the [`StateMachine`] until a terminal state:
//!
//! - A response frame ends the run as `Completed` or `ChildReportedFailure`.
//! - Caller cancellation sends the cancellation frame and starts the grace period.
//!   Exit within the grace period is `CancelledGracefully` (the caller sees
//!   [`ChildProcessError::Cancelled`]); otherwise the process is killed and the
//!   caller sees [`ChildProcessError::TerminatedByParent`].
//! - Missing heartbeats, a missed start deadline or an exceeded maximum run time
//!   also kill the child.
//! - An exit without a response is classified from the exit code.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ProcessChannel};
use crate::child::ChildArgs;
use crate::error::{ChildProcessError, Result, TerminationReason};
use crate::failure::{FailureDescriptor, FailureKind, exit_code};
use crate::state::{ProcessState, StateMachine};
use crate::wire::{ChildProcessInput, ChildProcessOutput, ParentFrame, encode_frame};

/// Default time a child gets to honor cancellation before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Default interval between child heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default silence after which a running child counts as stuck.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default deadline for the first frame after spawning.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a child gets to exit after writing its response.
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for child invocations.
#[derive(Debug, Clone)]
pub struct ChildProcessConfig {
    /// Executable to launch.
    pub executable: PathBuf,
    /// Arguments placed before the endpoint arguments (e.g. a subcommand).
    pub base_args: Vec<OsString>,
    pub grace_period: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub start_timeout: Duration,
    /// Upper bound on a whole run. `None` leaves runs unbounded.
    pub max_run_time: Option<Duration>,
    pub exit_timeout: Duration,
}

impl ChildProcessConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            base_args: Vec::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            start_timeout: DEFAULT_START_TIMEOUT,
            max_run_time: None,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self
    }

    pub fn with_max_run_time(mut self, max_run_time: Option<Duration>) -> Self {
        self.max_run_time = max_run_time;
        self
    }

    pub fn with_exit_timeout(mut self, exit_timeout: Duration) -> Self {
        self.exit_timeout = exit_timeout;
        self
    }

    /// The heartbeat interval must stay well below both the silence timeout and
    /// the grace period.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(ChildProcessError::Configuration(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.heartbeat_timeout {
            return Err(ChildProcessError::Configuration(format!(
                "heartbeat interval ({:?}) must be shorter than the heartbeat timeout ({:?})",
                self.heartbeat_interval, self.heartbeat_timeout
            )));
        }
        if self.heartbeat_interval >= self.grace_period {
            return Err(ChildProcessError::Configuration(format!(
                "heartbeat interval ({:?}) must be shorter than the grace period ({:?})",
                self.heartbeat_interval, self.grace_period
            )));
        }
        Ok(())
    }
}

/// Summary of one invocation.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub correlation_id: String,
    pub pid: Option<u32>,
    pub final_state: ProcessState,
    pub states: Vec<ProcessState>,
    pub duration: Duration,
    pub heartbeats: u64,
    pub exit_code: Option<i32>,
}

/// Runs single-shot requests in child processes.
#[derive(Debug, Clone)]
pub struct ChildProcessManager {
    config: ChildProcessConfig,
}

impl ChildProcessManager {
    pub fn new(config: ChildProcessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChildProcessConfig {
        &self.config
    }

    /// Run `input` in a fresh child process and return its typed output.
    pub async fn run_child_process<TIn, TOut>(
        &self,
        input: &TIn,
        cancel: &CancellationToken,
    ) -> Result<TOut>
    where
        TIn: Serialize,
        TOut: DeserializeOwned,
    {
        self.run_with_report(input, cancel).await.0
    }

    /// Like [`Self::run_child_process`], also returning the [`RunReport`].
    pub async fn run_with_report<TIn, TOut>(
        &self,
        input: &TIn,
        cancel: &CancellationToken,
    ) -> (Result<TOut>, RunReport)
    where
        TIn: Serialize,
        TOut: DeserializeOwned,
    {
        let started = Instant::now();
        let mut sm = StateMachine::new();
        let mut report = RunReport {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            pid: None,
            final_state: ProcessState::Starting,
            states: Vec::new(),
            duration: Duration::ZERO,
            heartbeats: 0,
            exit_code: None,
        };

        let result = self.drive(input, cancel, &mut sm, &mut report).await;

        report.final_state = sm.state();
        report.states = sm.history().collect();
        report.duration = started.elapsed();

        match &result {
            Ok(_) => info!(
                correlation_id = %report.correlation_id,
                pid = ?report.pid,
                state = %report.final_state,
                duration_ms = report.duration.as_millis() as u64,
                heartbeats = report.heartbeats,
                "Child process run finished"
            ),
            Err(e) => warn!(
                correlation_id = %report.correlation_id,
                pid = ?report.pid,
                state = %report.final_state,
                duration_ms = report.duration.as_millis() as u64,
                exit_code = ?report.exit_code,
                error = %e,
                "Child process run failed"
            ),
        }

        (result, report)
    }

    fn child_args(&self, correlation_id: &str) -> Vec<OsString> {
        let endpoint = ChildArgs::new(correlation_id, self.config.heartbeat_interval);
        self.config
            .base_args
            .iter()
            .cloned()
            .chain(endpoint.to_args().into_iter().map(OsString::from))
            .collect()
    }

    async fn drive<TIn, TOut>(
        &self,
        input: &TIn,
        cancel: &CancellationToken,
        sm: &mut StateMachine,
        report: &mut RunReport,
    ) -> Result<TOut>
    where
        TIn: Serialize,
        TOut: DeserializeOwned,
    {
        let request = ParentFrame::Request(ChildProcessInput {
            correlation_id: report.correlation_id.clone(),
            payload: input,
        });
        let serialized = encode_frame(&request)?;
        let args = self.child_args(&report.correlation_id);

        let mut channel = match ProcessChannel::launch(
            &self.config.executable,
            &args,
            report.correlation_id.clone(),
            serialized,
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                sm.transition(ProcessState::Crashed)?;
                return Err(e);
            }
        };
        report.pid = channel.pid();
        debug!(
            correlation_id = %report.correlation_id,
            pid = ?report.pid,
            executable = %self.config.executable.display(),
            "Child process started"
        );

        let outcome = self.await_outcome(&mut channel, cancel, sm, report).await;
        report.heartbeats = channel.heartbeats();
        let outcome = outcome?;

        match channel.await_exit(self.config.exit_timeout).await? {
            Some(status) => report.exit_code = status.code(),
            None => {
                warn!(pid = ?report.pid, "Child did not exit after responding, killing it");
                report.exit_code = channel.kill().await.and_then(|status| status.code());
            }
        }

        match outcome.into_result() {
            Ok(payload) => match serde_json::from_value::<TOut>(payload) {
                Ok(value) => {
                    sm.transition(ProcessState::Completed)?;
                    Ok(value)
                }
                Err(e) => {
                    sm.transition(ProcessState::Crashed)?;
                    Err(ChildProcessError::protocol(format!(
                        "response payload does not match the expected type: {e}"
                    )))
                }
            },
            Err(failure) => {
                sm.transition(ProcessState::ChildReportedFailure)?;
                Err(ChildProcessError::ChildFailure(failure))
            }
        }
    }

    /// Drive the channel until a response arrives or the run ends otherwise.
    async fn await_outcome(
        &self,
        channel: &mut ProcessChannel,
        cancel: &CancellationToken,
        sm: &mut StateMachine,
        report: &mut RunReport,
    ) -> Result<ChildProcessOutput<Value>> {
        let pid = channel.pid();
        let run_deadline = self.config.max_run_time.map(|limit| Instant::now() + limit);
        let mut grace_deadline: Option<Instant> = None;

        loop {
            let starting = sm.state() == ProcessState::Starting;
            let liveness_deadline = if starting && channel.heartbeats() == 0 {
                channel.started_at() + self.config.start_timeout
            } else {
                channel.last_activity() + self.config.heartbeat_timeout
            };
            let cancelling = grace_deadline.is_some();

            tokio::select! {
                biased;
                _ = sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if cancelling => {
                    warn!(
                        pid = ?pid,
                        grace_period = ?self.config.grace_period,
                        "Child ignored cancellation within the grace period, killing it"
                    );
                    report.exit_code = channel.kill().await.and_then(|status| status.code());
                    sm.transition(ProcessState::ForciblyTerminated)?;
                    return Err(ChildProcessError::TerminatedByParent {
                        pid,
                        reason: TerminationReason::GracePeriodElapsed,
                    });
                }
                _ = sleep_until(run_deadline.unwrap_or_else(Instant::now)), if run_deadline.is_some() && !cancelling => {
                    warn!(pid = ?pid, max_run_time = ?self.config.max_run_time, "Child exceeded its maximum run time, killing it");
                    report.exit_code = channel.kill().await.and_then(|status| status.code());
                    sm.transition(ProcessState::TimedOut)?;
                    return Err(ChildProcessError::TerminatedByParent {
                        pid,
                        reason: TerminationReason::TimedOut,
                    });
                }
                _ = cancel.cancelled(), if !cancelling => {
                    sm.transition(ProcessState::Cancelling)?;
                    info!(pid = ?pid, grace_period = ?self.config.grace_period, "Cancellation requested, signalling child");
                    if let Err(e) = channel.send_cancellation_signal().await {
                        debug!(pid = ?pid, error = %e, "Failed to deliver cancellation signal");
                    }
                    grace_deadline = Some(Instant::now() + self.config.grace_period);
                }
                event = channel.next_event() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            channel.kill().await;
                            sm.transition(ProcessState::Crashed)?;
                            return Err(e);
                        }
                    };
                    match event {
                        ChannelEvent::Heartbeat { .. } => {
                            if sm.state() == ProcessState::Starting {
                                sm.transition(ProcessState::Running)?;
                                debug!(pid = ?pid, "Child process is running");
                            }
                        }
                        ChannelEvent::Response(outcome) => {
                            if cancelling {
                                debug!(pid = ?pid, "Discarding response received while cancelling");
                                continue;
                            }
                            if sm.state() == ProcessState::Starting {
                                sm.transition(ProcessState::Running)?;
                            }
                            return Ok(outcome);
                        }
                        ChannelEvent::ProtocolViolation(msg) => {
                            report.exit_code = channel.kill().await.and_then(|status| status.code());
                            if cancelling {
                                sm.transition(ProcessState::ForciblyTerminated)?;
                                return Err(ChildProcessError::TerminatedByParent {
                                    pid,
                                    reason: TerminationReason::GracePeriodElapsed,
                                });
                            }
                            sm.transition(ProcessState::Crashed)?;
                            return Err(ChildProcessError::Protocol(msg));
                        }
                        ChannelEvent::Exited(status) => {
                            report.exit_code = status.code();
                            if cancelling {
                                sm.transition(ProcessState::CancelledGracefully)?;
                                return Err(ChildProcessError::Cancelled);
                            }
                            return Err(classify_exit(status, &channel.stderr_tail(), sm)?);
                        }
                    }
                }
                _ = sleep_until(liveness_deadline), if !cancelling => {
                    let reason = if starting {
                        TerminationReason::StartTimeout
                    } else {
                        TerminationReason::Unresponsive
                    };
                    warn!(pid = ?pid, reason = %reason, "Child process is stuck, killing it");
                    report.exit_code = channel.kill().await.and_then(|status| status.code());
                    sm.transition(ProcessState::ForciblyTerminated)?;
                    return Err(ChildProcessError::TerminatedByParent { pid, reason });
                }
            }
        }
    }
}

/// Turn an exit without a response into a typed error.
fn classify_exit(
    status: ExitStatus,
    stderr_tail: &str,
    sm: &mut StateMachine,
) -> Result<ChildProcessError> {
    let details = if stderr_tail.is_empty() {
        format!("child exited with {status}")
    } else {
        stderr_tail.to_string()
    };

    let mapped = status.code().and_then(FailureKind::from_exit_code);
    if let Some(kind) = mapped {
        if sm.state() == ProcessState::Starting {
            sm.transition(ProcessState::Running)?;
        }
        sm.transition(ProcessState::ChildReportedFailure)?;
        return Ok(ChildProcessError::ChildFailure(FailureDescriptor::new(
            kind, details,
        )));
    }

    sm.transition(ProcessState::Crashed)?;
    let details = match status.code() {
        Some(exit_code::SUCCESS) => "child exited successfully without a response".to_string(),
        Some(exit_code::CANCELLED) => format!("child stopped without being cancelled: {details}"),
        _ => details,
    };
    Ok(ChildProcessError::Crash {
        exit_code: status.code(),
        details,
    })
}
