//! Errors surfaced to callers of the child process manager.

use thiserror::Error;

use crate::failure::{FailureDescriptor, FailureKind};
use crate::state::ProcessState;

/// Why the host killed a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TerminationReason {
    /// Cancellation was signalled and the child did not exit within the grace period.
    #[strum(to_string = "grace period elapsed after cancellation")]
    GracePeriodElapsed,
    /// No frame arrived within the start timeout.
    #[strum(to_string = "no heartbeat within start timeout")]
    StartTimeout,
    /// Heartbeats stopped while the child was running.
    #[strum(to_string = "heartbeat lost")]
    Unresponsive,
    /// The run exceeded its maximum duration.
    #[strum(to_string = "maximum run time exceeded")]
    TimedOut,
}

pub type Result<T> = std::result::Result<T, ChildProcessError>;

#[derive(Debug, Error)]
pub enum ChildProcessError {
    /// The child reported a failure descriptor (or exited with a mapped code).
    #[error("Child reported failure: {0}")]
    ChildFailure(FailureDescriptor),

    /// The caller cancelled and the child honored it within the grace period.
    #[error("Child process run was cancelled")]
    Cancelled,

    #[error("Child process (pid {pid:?}) was terminated by parent: {reason}")]
    TerminatedByParent {
        pid: Option<u32>,
        reason: TerminationReason,
    },

    /// The child exited without a parseable outcome.
    #[error("Child process crashed (exit code {exit_code:?}): {details}")]
    Crash {
        exit_code: Option<i32>,
        details: String,
    },

    #[error("Failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Child process IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Child process protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        from: ProcessState,
        to: ProcessState,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ChildProcessError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Taxonomy kind of this error. `None` for caller-initiated cancellation.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::ChildFailure(descriptor) => Some(descriptor.kind),
            Self::Cancelled => None,
            Self::TerminatedByParent { .. } => Some(FailureKind::TerminatedByParent),
            Self::Crash { .. } | Self::Protocol(_) => Some(FailureKind::Crash),
            Self::Spawn(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::InvalidStateTransition { .. }
            | Self::Configuration(_) => Some(FailureKind::Generic),
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ChildFailure(descriptor) if descriptor.is_retriable)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_terminated_by_parent(&self) -> bool {
        matches!(self, Self::TerminatedByParent { .. })
    }

    /// Flatten into a descriptor, e.g. for persisting a run outcome.
    pub fn to_descriptor(&self) -> Option<FailureDescriptor> {
        match self {
            Self::ChildFailure(descriptor) => Some(descriptor.clone()),
            other => other
                .kind()
                .map(|kind| FailureDescriptor::new(kind, other.to_string())),
        }
    }
}

impl From<FailureDescriptor> for ChildProcessError {
    fn from(descriptor: FailureDescriptor) -> Self {
        Self::ChildFailure(descriptor)
    }
}
