//! Wire framing for the parent/child channel.
//!
//! Every protocol message is one line: [`FRAME_PREFIX`] followed by a JSON object
//! tagged by `type`. Lines without the prefix are not frames; a plugin printing to
//! stdout therefore cannot corrupt the channel.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::failure::FailureDescriptor;

/// Marker that starts every frame line.
pub const FRAME_PREFIX: &str = "@@ipc ";

/// Request payload plus the correlation id of the invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildProcessInput<T> {
    pub correlation_id: String,
    pub payload: T,
}

/// Outcome of one invocation: exactly one of payload or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChildProcessOutput<T> {
    Success { payload: T },
    Failure { failure: FailureDescriptor },
}

impl<T> ChildProcessOutput<T> {
    pub fn into_result(self) -> Result<T, FailureDescriptor> {
        match self {
            Self::Success { payload } => Ok(payload),
            Self::Failure { failure } => Err(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl<T> From<Result<T, FailureDescriptor>> for ChildProcessOutput<T> {
    fn from(result: Result<T, FailureDescriptor>) -> Self {
        match result {
            Ok(payload) => Self::Success { payload },
            Err(failure) => Self::Failure { failure },
        }
    }
}

/// Frames written by the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentFrame<T> {
    Request(ChildProcessInput<T>),
    Cancel,
}

/// Frames written by the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildFrame<T> {
    Heartbeat {
        seq: u64,
    },
    Response {
        correlation_id: String,
        outcome: ChildProcessOutput<T>,
    },
}

/// Encode a frame as one newline-terminated line.
pub fn encode_frame<F: Serialize>(frame: &F) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(frame)?;
    Ok(format!("{FRAME_PREFIX}{json}\n"))
}

/// Decode a line. Returns `None` when the line is not a frame.
pub fn decode_frame<F: DeserializeOwned>(line: &str) -> Option<Result<F, serde_json::Error>> {
    let body = line
        .trim_end_matches(['\r', '\n'])
        .strip_prefix(FRAME_PREFIX)?;
    Some(serde_json::from_str(body))
}
