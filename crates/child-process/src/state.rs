//! Host-side lifecycle of one child invocation.
//!
//! ```text
//! Starting ──► Running ──┬──► Completed
//!    │            │      ├──► ChildReportedFailure
//!    │            │      ├──► TimedOut
//!    │            │      ├──► Crashed
//!    │            │      └──► ForciblyTerminated   (unresponsive)
//!    │            ▼
//!    └──────► Cancelling ──┬──► CancelledGracefully
//!                          └──► ForciblyTerminated (grace period elapsed)
//! ```
//!
//! `Starting` may also end directly in `Crashed` (the child died before its first
//! frame), `ForciblyTerminated` (start timeout) or `TimedOut`.

use std::time::Instant;

use crate::error::ChildProcessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ProcessState {
    Starting,
    Running,
    Cancelling,
    Completed,
    ChildReportedFailure,
    CancelledGracefully,
    ForciblyTerminated,
    TimedOut,
    Crashed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Starting | Self::Running | Self::Cancelling)
    }

    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (
                Starting,
                Running | Cancelling | Crashed | ForciblyTerminated | TimedOut
            )
                | (
                    Running,
                    Completed
                        | ChildReportedFailure
                        | Cancelling
                        | TimedOut
                        | Crashed
                        | ForciblyTerminated
                )
                | (Cancelling, CancelledGracefully | ForciblyTerminated)
        )
    }
}

/// Tracks the current state and when each state was entered.
#[derive(Debug)]
pub struct StateMachine {
    state: ProcessState,
    history: Vec<(ProcessState, Instant)>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ProcessState::Starting,
            history: vec![(ProcessState::Starting, Instant::now())],
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// States visited so far, oldest first.
    pub fn history(&self) -> impl Iterator<Item = ProcessState> + '_ {
        self.history.iter().map(|(state, _)| *state)
    }

    pub fn transition(&mut self, next: ProcessState) -> Result<(), ChildProcessError> {
        if !self.state.can_transition_to(next) {
            return Err(ChildProcessError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(from = %self.state, to = %next, "Child process state transition");
        self.state = next;
        self.history.push((next, Instant::now()));
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
