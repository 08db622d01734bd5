//! Build payload types.

use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::task::TaskType;

/// Git hosting provider for the repository under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    Github,
    Gitlab,
    Bitbucket,
}

/// Webhook event that triggered the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Push,
    PullRequest,
}

/// Build payload fetched at run start. Immutable after validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPayload {
    pub task_id: String,
    pub build_id: String,
    pub org_id: String,
    pub repo_id: String,

    /// "org/repo".
    pub repo_slug: String,
    pub repo_link: String,
    /// "fork-org/fork-repo" when the build comes from a fork.
    #[serde(default)]
    pub fork_slug: String,

    pub git_provider: GitProvider,
    pub event_type: EventType,

    /// Commit the agent builds and tests.
    pub build_target_commit: String,
    pub branch_name: String,

    pub license_tier: String,
    #[serde(default)]
    pub collect_coverage: bool,

    /// Name of the test configuration file inside the repo.
    pub config_file_name: String,

    /// Task type, stamped by the agent once the run mode is known.
    #[serde(default)]
    pub task_type: Option<TaskType>,
}

impl BuildPayload {
    /// Check the invariants every downstream phase depends on.
    pub fn validate(&self) -> Result<(), AgentError> {
        for (field, value) in [
            ("task_id", &self.task_id),
            ("build_id", &self.build_id),
            ("org_id", &self.org_id),
            ("repo_id", &self.repo_id),
            ("build_target_commit", &self.build_target_commit),
            ("config_file_name", &self.config_file_name),
        ] {
            if value.is_empty() {
                return Err(AgentError::failed(format!(
                    "invalid build payload: {field} is empty"
                )));
            }
        }
        Ok(())
    }
}

/// Token scheme of an oauth secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Bearer,
    Basic,
}

/// Oauth credential used for clone and diff fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Oauth {
    pub access_token: String,
    pub token_type: TokenType,
}
