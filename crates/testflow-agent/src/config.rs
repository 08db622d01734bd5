//! Agent run configuration.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use testflow_core::TaskType;

/// Run mode, selected once at startup. Coverage short-circuits the other
/// modes; Execute and Flaky share the execution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    Discover,
    Execute,
    Flaky,
    Coverage,
}

impl RunMode {
    /// Task type reported for this mode. Coverage never creates a task
    /// record, so it has no mapping.
    pub fn task_type(&self) -> Option<TaskType> {
        match self {
            RunMode::Discover => Some(TaskType::Discovery),
            RunMode::Execute => Some(TaskType::Execution),
            RunMode::Flaky => Some(TaskType::Flaky),
            RunMode::Coverage => None,
        }
    }

    /// True for the modes that run previously discovered tests.
    pub fn is_execution(&self) -> bool {
        matches!(self, RunMode::Execute | RunMode::Flaky)
    }
}

/// Testflow agent - per-commit CI test orchestrator
#[derive(Debug, Parser)]
#[command(name = "testflow-agent")]
#[command(about = "Runs one test task inside an ephemeral CI container", long_about = None)]
pub struct Config {
    /// Run mode for this invocation
    #[arg(long, value_enum, default_value_t = RunMode::Discover)]
    pub mode: RunMode,

    /// Address the build payload is fetched from
    #[arg(long, default_value = "http://localhost:8000/payload")]
    pub payload_address: String,

    /// Base URL of the remote report/ingest API
    #[arg(long, default_value = "http://localhost:8000")]
    pub report_host: String,

    /// Base URL of the in-container cache/coverage sidecar
    #[arg(long, default_value = "http://localhost:8181")]
    pub sidecar_host: String,

    /// Environment tag published to subprocesses as ENV
    #[arg(long, default_value = "dev")]
    pub env: String,

    /// Root directory the repository is cloned/extracted into
    #[arg(long, default_value = "/testflow/repo")]
    pub repo_root: PathBuf,

    /// Base directory coverage artifacts are collected under
    #[arg(long, default_value = "/testflow/coverage")]
    pub coverage_base_dir: PathBuf,

    /// Path of the mounted oauth secret file
    #[arg(long, default_value = "/vault/secrets/oauth.json")]
    pub oauth_secret_path: PathBuf,

    /// Path of the mounted repo secret file
    #[arg(long, default_value = "/vault/secrets/repo.json")]
    pub repo_secret_path: PathBuf,

    /// File the resolved blocklist is written to for runners to read
    #[arg(long, default_value = "/testflow/blocktests.json")]
    pub block_tests_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_task_type() {
        assert_eq!(RunMode::Discover.task_type(), Some(TaskType::Discovery));
        assert_eq!(RunMode::Execute.task_type(), Some(TaskType::Execution));
        assert_eq!(RunMode::Flaky.task_type(), Some(TaskType::Flaky));
        assert_eq!(RunMode::Coverage.task_type(), None);
    }

    #[test]
    fn test_execution_modes_share_path() {
        assert!(RunMode::Execute.is_execution());
        assert!(RunMode::Flaky.is_execution());
        assert!(!RunMode::Discover.is_execution());
        assert!(!RunMode::Coverage.is_execution());
    }

    #[test]
    fn test_defaults_parse() {
        let config = Config::parse_from(["testflow-agent"]);
        assert_eq!(config.mode, RunMode::Discover);
        assert_eq!(config.repo_root, PathBuf::from("/testflow/repo"));
    }
}
