//! Run one request/response unit of work inside an isolated child process.
//!
//! The host side ([`ChildProcessManager`]) spawns the child, sends one request
//! frame, watches heartbeats and escalates cancellation from a cooperative
//! signal to an OS-level kill. The child side ([`child::run_and_listen`]) reads
//! the request, runs a local handler and writes exactly one response frame.

pub mod channel;
pub mod child;
pub mod command;
pub mod error;
pub mod failure;
pub mod manager;
pub mod state;
pub mod wire;

pub use channel::{AwaitOutcome, ChannelEvent, ProcessChannel, ProcessHandle};
pub use child::{ChildArgs, HandlerError, panic_message, run_and_listen};
pub use error::{ChildProcessError, Result, TerminationReason};
pub use failure::{FailureDescriptor, FailureKind, exit_code};
pub use manager::{ChildProcessConfig, ChildProcessManager, RunReport};
pub use state::{ProcessState, StateMachine};
pub use wire::{ChildFrame, ChildProcessInput, ChildProcessOutput, ParentFrame};
