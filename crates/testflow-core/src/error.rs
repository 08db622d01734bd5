//! Core domain errors.

use thiserror::Error;

/// Errors produced while driving an agent run.
///
/// The variants matter to the status classifier: `StatusFailed` is the
/// distinguished user-actionable failure kind, `Aborted` marks run
/// cancellation, and `DiffNotFound` is a recoverable condition that call
/// sites convert into a full-discovery fallback instead of classifying.
#[derive(Debug, Error)]
pub enum AgentError {
    /// User-actionable failure. The remark is safe to surface verbatim.
    #[error("{remark}")]
    StatusFailed { remark: String },

    /// The run was cancelled.
    #[error("task aborted")]
    Aborted,

    /// No diff could be computed for this build target.
    #[error("git diff not found")]
    DiffNotFound,

    /// Internal failure. The message is logged but never surfaced in the
    /// task remark.
    #[error("{0}")]
    Internal(String),

    /// Subprocess spawn/wait failure.
    #[error("subprocess error: {0}")]
    Subprocess(#[from] std::io::Error),

    /// Payload or result (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Shorthand for a user-actionable failure.
    pub fn failed(remark: impl Into<String>) -> Self {
        Self::StatusFailed {
            remark: remark.into(),
        }
    }

    /// Shorthand for an internal failure.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this error is the recoverable missing-diff condition.
    pub fn is_diff_not_found(&self) -> bool {
        matches!(self, Self::DiffNotFound)
    }
}
