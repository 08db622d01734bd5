//! Per-run execution context published to every subprocess.
//!
//! The fixed variable set every subprocess in a run depends on travels in
//! an explicit context struct, built once before the first subprocess
//! spawn and merged into each child's environment. Nothing mutates shared
//! process state; per-call overlays are applied at spawn time.

use std::path::{Path, PathBuf};

use testflow_core::BuildPayload;

use crate::config::Config;

/// Loopback endpoint the runner POSTs discovered test lists to.
pub const ENDPOINT_POST_TEST_LIST: &str = "http://localhost:9876/test-list";
/// Loopback endpoint the runner POSTs execution results to.
pub const ENDPOINT_POST_TEST_RESULTS: &str = "http://localhost:9876/results";

/// Commands that install the framework runner binaries into the workspace.
pub const INSTALL_RUNNER_CMDS: &[&str] = &["npm install --no-save @testflow/runners"];

/// The fixed environment set every subprocess in a run depends on.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub task_id: String,
    pub org_id: String,
    pub build_id: String,
    pub commit_id: String,
    pub repo_id: String,
    pub coverage_dir: PathBuf,
    pub branch_name: String,
    pub env_tag: String,
    pub repo_root: PathBuf,
    pub block_tests_file: PathBuf,

    /// Directories prepended to the child PATH (node toolchain installs).
    path_overlay: Vec<PathBuf>,
}

impl RunContext {
    /// Build the context from the validated payload. Must happen before any
    /// subprocess spawn; every spawn reads from it afterwards.
    pub fn new(config: &Config, payload: &BuildPayload, coverage_dir: &Path) -> Self {
        Self {
            task_id: payload.task_id.clone(),
            org_id: payload.org_id.clone(),
            build_id: payload.build_id.clone(),
            commit_id: payload.build_target_commit.clone(),
            repo_id: payload.repo_id.clone(),
            coverage_dir: coverage_dir.to_path_buf(),
            branch_name: payload.branch_name.clone(),
            env_tag: config.env.clone(),
            repo_root: config.repo_root.clone(),
            block_tests_file: config.block_tests_file.clone(),
            path_overlay: Vec::new(),
        }
    }

    /// Prepend a directory to the PATH seen by subsequent subprocesses.
    pub fn prepend_path(&mut self, dir: impl Into<PathBuf>) {
        self.path_overlay.insert(0, dir.into());
    }

    /// The environment pairs published to a child process.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("TASK_ID".to_string(), self.task_id.clone()),
            ("ORG_ID".to_string(), self.org_id.clone()),
            ("BUILD_ID".to_string(), self.build_id.clone()),
            ("COMMIT_ID".to_string(), self.commit_id.clone()),
            ("REPO_ID".to_string(), self.repo_id.clone()),
            (
                "CODE_COVERAGE_DIR".to_string(),
                self.coverage_dir.display().to_string(),
            ),
            ("BRANCH_NAME".to_string(), self.branch_name.clone()),
            ("ENV".to_string(), self.env_tag.clone()),
            (
                "ENDPOINT_POST_TEST_LIST".to_string(),
                ENDPOINT_POST_TEST_LIST.to_string(),
            ),
            (
                "ENDPOINT_POST_TEST_RESULTS".to_string(),
                ENDPOINT_POST_TEST_RESULTS.to_string(),
            ),
            (
                "REPO_ROOT".to_string(),
                self.repo_root.display().to_string(),
            ),
            (
                "BLOCK_TESTS_FILE".to_string(),
                self.block_tests_file.display().to_string(),
            ),
        ];
        if let Some(path) = self.merged_path() {
            vars.push(("PATH".to_string(), path));
        }
        vars
    }

    /// PATH with the overlay prepended, or None when there is no overlay
    /// (the child then inherits the parent PATH untouched).
    fn merged_path(&self) -> Option<String> {
        if self.path_overlay.is_empty() {
            return None;
        }
        let inherited = std::env::var("PATH").unwrap_or_default();
        let mut parts: Vec<String> = self
            .path_overlay
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        if !inherited.is_empty() {
            parts.push(inherited);
        }
        Some(parts.join(":"))
    }
}
