//! Failure taxonomy shared by both sides of the process boundary.
//!
//! Errors never cross the boundary as language-level error types. They are
//! flattened into a [`FailureDescriptor`] (kind + message + retriable flag) and
//! mirrored in the child's exit code, so the host can reconstruct the kind even
//! when the response frame is lost.

use serde::{Deserialize, Serialize};

/// Exit codes with a meaning outside the failure taxonomy.
pub mod exit_code {
    /// The child produced a success response.
    pub const SUCCESS: i32 = 0;
    /// The child could not parse its arguments or the request frame.
    pub const PROTOCOL_ERROR: i32 = 2;
    /// The child observed cancellation and stopped without a response.
    pub const CANCELLED: i32 = 3;
}

/// Kind of failure a run can end with.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The requested detector does not exist.
    NotFound,
    /// A requested resource does not match the detector's supported type.
    Incompatible,
    /// The detector exists but could not be loaded.
    LoadFailure,
    /// A dependency of the detector failed in a way that may succeed later.
    TransientDependency,
    /// The host killed the child (grace period elapsed, unresponsive, timed out).
    TerminatedByParent,
    /// The child died without a parseable outcome.
    Crash,
    /// Any other fault raised by the detector.
    Generic,
}

impl FailureKind {
    /// Only transient dependency failures are worth retrying.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::TransientDependency)
    }

    /// Exit code a child uses to report this kind.
    ///
    /// Host-side kinds have no child exit code.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            Self::NotFound => Some(10),
            Self::Incompatible => Some(11),
            Self::LoadFailure => Some(12),
            Self::TransientDependency => Some(13),
            Self::Generic => Some(14),
            Self::TerminatedByParent | Self::Crash => None,
        }
    }

    /// Map a child exit code back to its kind. Unmapped codes return `None`.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            10 => Some(Self::NotFound),
            11 => Some(Self::Incompatible),
            12 => Some(Self::LoadFailure),
            13 => Some(Self::TransientDependency),
            14 => Some(Self::Generic),
            _ => None,
        }
    }
}

/// Serializable description of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FailureDescriptor {
    pub kind: FailureKind,
    pub message: String,
    pub is_retriable: bool,
}

impl FailureDescriptor {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            is_retriable: kind.is_retriable(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn incompatible(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Incompatible, message)
    }

    pub fn load_failure(message: impl Into<String>) -> Self {
        Self::new(FailureKind::LoadFailure, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientDependency, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Generic, message)
    }

    /// Exit code the child terminates with after reporting this failure.
    ///
    /// Kinds without a child-side code are reported as generic.
    pub fn exit_code(&self) -> i32 {
        self.kind
            .exit_code()
            .or(FailureKind::Generic.exit_code())
            .unwrap_or(1)
    }
}
