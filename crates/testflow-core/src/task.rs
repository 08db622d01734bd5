//! Task run record and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::{BuildPayload, GitProvider};
use crate::status::Status;

/// Run mode the agent was started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Discovery,
    Execution,
    Flaky,
}

/// The task record the agent reports against.
///
/// Created `Running` at run start and mutated exactly once more, at
/// finalization, to a terminal status. `finalize` latches: once terminal,
/// further calls are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: String,
    pub build_id: String,
    pub org_id: String,
    pub repo_id: String,
    pub repo_slug: String,
    pub repo_link: String,
    pub git_provider: GitProvider,

    #[serde(rename = "type")]
    pub task_type: TaskType,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    pub status: Status,
    #[serde(default)]
    pub remark: String,
}

impl TaskRun {
    /// Create a running task record from the validated payload.
    pub fn new(payload: &BuildPayload, task_type: TaskType, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id: payload.task_id.clone(),
            build_id: payload.build_id.clone(),
            org_id: payload.org_id.clone(),
            repo_id: payload.repo_id.clone(),
            repo_slug: payload.repo_slug.clone(),
            repo_link: payload.repo_link.clone(),
            git_provider: payload.git_provider,
            task_type,
            started_at,
            finished_at: None,
            status: Status::Running,
            remark: String::new(),
        }
    }

    /// Record the terminal status, remark and end time.
    ///
    /// Returns false (and changes nothing) if the run is already terminal.
    pub fn finalize(&mut self, status: Status, remark: String, finished_at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.remark = remark;
        self.finished_at = Some(finished_at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{EventType, GitProvider};

    fn payload() -> BuildPayload {
        BuildPayload {
            task_id: "task-1".to_string(),
            build_id: "build-1".to_string(),
            org_id: "org-1".to_string(),
            repo_id: "repo-1".to_string(),
            repo_slug: "acme/widgets".to_string(),
            repo_link: "https://github.com/acme/widgets".to_string(),
            fork_slug: String::new(),
            git_provider: GitProvider::Github,
            event_type: EventType::Push,
            build_target_commit: "abc123".to_string(),
            branch_name: "main".to_string(),
            license_tier: "small".to_string(),
            collect_coverage: false,
            config_file_name: ".testflow.yml".to_string(),
            task_type: None,
        }
    }

    #[test]
    fn test_new_run_is_running() {
        let run = TaskRun::new(&payload(), TaskType::Discovery, Utc::now());
        assert_eq!(run.status, Status::Running);
        assert!(run.finished_at.is_none());
    }

    #[test]
    fn test_finalize_latches() {
        let mut run = TaskRun::new(&payload(), TaskType::Discovery, Utc::now());
        assert!(run.finalize(Status::Passed, String::new(), Utc::now()));

        // A second finalize must not move the run out of its terminal state.
        assert!(!run.finalize(Status::Error, "late".to_string(), Utc::now()));
        assert_eq!(run.status, Status::Passed);
        assert!(run.remark.is_empty());
    }
}
