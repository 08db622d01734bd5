//! Seams for the subsystems the agent orchestrates but does not own.
//!
//! The lifecycle controller composes these behind `Arc<dyn _>` so tests
//! can substitute hand-rolled fakes; thin production implementations live
//! in `external`, `exec` and `report`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use testflow_core::{
    AgentError, BuildPayload, CommandBlock, Diff, DiscoveryResult, EventType, ExecutionResponse,
    ExecutionResults, Oauth, Submodule, TasConfig, TasConfigV2, TaskRun,
};

use crate::context::RunContext;

/// What a batch of commands is for; carried into logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    PreRun,
    PostRun,
    InstallRunners,
    InstallNode,
    InitGit,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::PreRun => "pre-run",
            CommandKind::PostRun => "post-run",
            CommandKind::InstallRunners => "install-runners",
            CommandKind::InstallNode => "install-node",
            CommandKind::InitGit => "init-git",
        }
    }
}

/// Fetches and validates the build payload the run is parameterized by.
#[async_trait]
pub trait PayloadManager: Send + Sync {
    async fn fetch_payload(&self, address: &str) -> Result<BuildPayload, AgentError>;
    fn validate_payload(&self, payload: &BuildPayload) -> Result<(), AgentError>;
}

/// Clones the repository for discovery runs.
#[async_trait]
pub trait GitManager: Send + Sync {
    async fn clone_repo(
        &self,
        cancel: &CancellationToken,
        payload: &BuildPayload,
        oauth: &Oauth,
    ) -> Result<(), AgentError>;
}

/// Workspace cache blob transport.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Best-effort warm start: a missing blob is not an error.
    async fn download(&self, cancel: &CancellationToken, key: &str) -> Result<(), AgentError>;
    async fn upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        paths: &[String],
    ) -> Result<(), AgentError>;
    /// Persist the prepared workspace for the execution phase.
    async fn cache_workspace(&self, cancel: &CancellationToken) -> Result<(), AgentError>;
    /// Replicate a previously persisted workspace.
    async fn extract_workspace(&self, cancel: &CancellationToken) -> Result<(), AgentError>;
}

/// Loads and validates the repository's test configuration file.
#[async_trait]
pub trait ConfigManager: Send + Sync {
    async fn get_version(&self, filename: &str) -> Result<u32, AgentError>;
    async fn load_and_validate_v1(
        &self,
        filename: &str,
        event_type: EventType,
        tier: &str,
    ) -> Result<TasConfig, AgentError>;
    async fn load_and_validate_v2(
        &self,
        filename: &str,
        event_type: EventType,
        tier: &str,
    ) -> Result<TasConfigV2, AgentError>;
}

/// Runs user and internal command batches.
#[async_trait]
pub trait ExecutionManager: Send + Sync {
    async fn execute_user_commands(
        &self,
        cancel: &CancellationToken,
        kind: CommandKind,
        block: &CommandBlock,
        secrets: &HashMap<String, String>,
        cwd: &Path,
        run_context: &RunContext,
    ) -> Result<(), AgentError>;

    async fn execute_internal_commands(
        &self,
        cancel: &CancellationToken,
        kind: CommandKind,
        commands: &[String],
        cwd: &Path,
        run_context: &RunContext,
    ) -> Result<(), AgentError>;
}

/// Reports task status transitions.
#[async_trait]
pub trait TaskStatusReporter: Send + Sync {
    async fn update_status(&self, task_run: &TaskRun) -> Result<(), AgentError>;
}

/// Forwards decorated discovery results to the ingest endpoint.
#[async_trait]
pub trait IngestReporter: Send + Sync {
    async fn report_discovery(&self, result: &DiscoveryResult) -> Result<(), AgentError>;
}

/// Computes the changed-file diff for the build target.
///
/// Fails with [`AgentError::DiffNotFound`] when no diff can be computed;
/// callers convert that into a full-discovery fallback.
#[async_trait]
pub trait DiffProvider: Send + Sync {
    async fn changed_files(
        &self,
        cancel: &CancellationToken,
        payload: &BuildPayload,
        oauth: &Oauth,
    ) -> Result<Diff, AgentError>;
}

/// Reads mounted secrets.
pub trait SecretProvider: Send + Sync {
    fn oauth_secret(&self, path: &Path) -> Result<Oauth, AgentError>;
    fn repo_secrets(&self, path: &Path) -> Result<HashMap<String, String>, AgentError>;
}

/// Resolves blocklisted tests and materializes them for the runners.
#[async_trait]
pub trait BlockTestService: Send + Sync {
    fn blocklist_source_v1(&self, config: &TasConfig) -> String;
    fn blocklist_source_v2(&self, submodule: &Submodule) -> String;
    async fn fetch_block_tests(
        &self,
        cancel: &CancellationToken,
        source: &str,
        repo_id: &str,
        branch: &str,
    ) -> Result<(), AgentError>;
}

/// Merges and uploads coverage artifacts (coverage mode only).
#[async_trait]
pub trait CoverageManager: Send + Sync {
    async fn merge_and_upload(
        &self,
        cancel: &CancellationToken,
        payload: &BuildPayload,
    ) -> Result<(), AgentError>;
}

/// Runs previously discovered tests and reports their results.
#[async_trait]
pub trait TestExecutionService: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        config: &TasConfig,
        payload: &BuildPayload,
        secrets: &HashMap<String, String>,
        run_context: &RunContext,
    ) -> Result<ExecutionResults, AgentError>;

    async fn send_results(
        &self,
        results: &ExecutionResults,
    ) -> Result<ExecutionResponse, AgentError>;
}
