//! Runner-produced results: discovery output and execution stats.

use serde::{Deserialize, Serialize};

use crate::config::SplitMode;
use crate::status::Status;

/// A single discovered test entry as reported by the runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredTest {
    pub test_id: String,
    pub title: String,
    pub file_path: String,
    #[serde(default)]
    pub blocked: bool,
}

/// Result of one discovery subprocess, decorated by the dispatcher with
/// run-level metadata before being reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub task_id: String,
    pub build_id: String,
    pub repo_id: String,
    pub commit_id: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub tests: Vec<DiscoveredTest>,

    // Decorations applied by the dispatcher.
    #[serde(default)]
    pub parallelism: u32,
    #[serde(default)]
    pub split_mode: SplitMode,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub container_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submodule: Option<String>,
}

/// One test's execution outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    /// "passed", "failed", "skipped", "blocklisted".
    pub status: String,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Results for one discovered suite/file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub suite_id: String,
    #[serde(default)]
    pub tests: Vec<TestResult>,
}

/// Aggregated execution stats for a run, POSTed to the report endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResults {
    pub task_id: String,
    pub build_id: String,
    pub repo_id: String,
    pub commit_id: String,
    #[serde(default)]
    pub results: Vec<SuiteResult>,
}

impl ExecutionResults {
    /// Derive the task status from raw runner results: any failed test
    /// fails the run.
    pub fn task_status(&self) -> Status {
        for suite in &self.results {
            for test in &suite.tests {
                if test.status == "failed" {
                    return Status::Failed;
                }
            }
        }
        Status::Passed
    }
}

/// Response to a results report, carrying the authoritative task status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub task_status: Status,
    #[serde(default)]
    pub remark: Option<String>,
}
