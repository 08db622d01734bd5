//! Task status and the terminal-outcome classifier.

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Remark substituted for internal errors so implementation detail never
/// reaches the task record.
pub const GENERIC_ERROR_REMARK: &str = "An unexpected error occurred while running the task";

/// Status of a task run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Run in progress.
    #[default]
    Running,
    /// Run completed, all tests passed (or discovery succeeded).
    Passed,
    /// Run completed with a user-actionable failure.
    Failed,
    /// Run hit an internal error.
    Error,
    /// Run was cancelled.
    Aborted,
}

impl Status {
    /// Returns true if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Outcome of the controlled phase of a run, fed to [`classify`].
#[derive(Debug)]
pub enum RunOutcome {
    /// The phase completed and reports this status (discovery passes;
    /// execution carries the status derived from runner results, with an
    /// optional remark from the report response).
    Completed { status: Status, remark: Option<String> },
    /// The phase returned an error.
    Errored(AgentError),
    /// The phase panicked and was recovered at the outer scope.
    Panicked,
}

/// Map a run outcome to its terminal status and remark.
///
/// Pure: the only inputs are the outcome value itself. `DiffNotFound` never
/// reaches this function in correct control flow (call sites convert it into
/// a full-discovery fallback); if it does, it is an internal error.
pub fn classify(outcome: &RunOutcome) -> (Status, String) {
    match outcome {
        RunOutcome::Panicked => (Status::Error, GENERIC_ERROR_REMARK.to_string()),
        RunOutcome::Errored(err) => match err {
            AgentError::Aborted => (Status::Aborted, "Task aborted".to_string()),
            AgentError::StatusFailed { remark } => (Status::Failed, remark.clone()),
            _ => (Status::Error, GENERIC_ERROR_REMARK.to_string()),
        },
        RunOutcome::Completed { status, remark } => {
            (*status, remark.clone().unwrap_or_default())
        }
    }
}
