//! Thin production implementations of the collaborator seams.
//!
//! Each of these fronts a subsystem the agent orchestrates but does not
//! own: the payload service, git hosting, the in-container cache sidecar,
//! the repo's YAML configuration, mounted secrets, the blocklist API and
//! the execution runner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use testflow_core::{
    config::parse_major_version, AgentError, BuildPayload, Diff, EventType, ExecutionResponse,
    ExecutionResults, Oauth, Submodule, TasConfig, TasConfigV2, TokenType,
};

use crate::collaborators::{
    BlockTestService, CacheStore, ConfigManager, CoverageManager, DiffProvider, GitManager,
    PayloadManager, SecretProvider, TestExecutionService,
};
use crate::context::RunContext;
use crate::discovery::framework_runner;
use crate::exec::{mask_secrets, merged_env, run_shell_command, spawn_masked_pump};
use crate::rendezvous::{ResultCollector, POST_EXIT_DEADLINE};
use crate::report::ReportClient;

const HTTP_TIMEOUT: Duration = Duration::from_secs(45);

fn http_client() -> Result<reqwest::Client, AgentError> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| AgentError::internal(format!("failed to build http client: {e}")))
}

/// Run a reqwest future under the cancellation token.
async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, AgentError>>,
) -> Result<T, AgentError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Aborted),
        result = fut => result,
    }
}

/// Fetches the build payload over HTTP.
pub struct HttpPayloadManager {
    inner: reqwest::Client,
}

impl HttpPayloadManager {
    pub fn new() -> Result<Self, AgentError> {
        Ok(Self {
            inner: http_client()?,
        })
    }
}

#[async_trait]
impl PayloadManager for HttpPayloadManager {
    async fn fetch_payload(&self, address: &str) -> Result<BuildPayload, AgentError> {
        debug!(address = %address, "fetching build payload");
        let response = self
            .inner
            .get(address)
            .send()
            .await
            .map_err(|e| AgentError::internal(format!("payload fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AgentError::internal(format!(
                "payload fetch returned status {}",
                response.status()
            )));
        }
        response
            .json::<BuildPayload>()
            .await
            .map_err(|e| AgentError::internal(format!("invalid payload body: {e}")))
    }

    fn validate_payload(&self, payload: &BuildPayload) -> Result<(), AgentError> {
        payload.validate()
    }
}

/// Clones the target commit with a shallow fetch.
pub struct ShallowGitManager {
    repo_root: PathBuf,
}

impl ShallowGitManager {
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }
}

#[async_trait]
impl GitManager for ShallowGitManager {
    async fn clone_repo(
        &self,
        cancel: &CancellationToken,
        payload: &BuildPayload,
        oauth: &Oauth,
    ) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(&self.repo_root)
            .await
            .map_err(|e| AgentError::internal(format!("failed to create repo root: {e}")))?;

        let scheme = match oauth.token_type {
            TokenType::Bearer => "Bearer",
            TokenType::Basic => "Basic",
        };
        let auth_header = format!("Authorization: {scheme} {}", oauth.access_token);
        let commit = &payload.build_target_commit;
        let branch = &payload.branch_name;

        let commands = vec![
            "git init".to_string(),
            format!("git remote add origin {}.git", payload.repo_link),
            format!(
                "git -c http.extraheader='{auth_header}' fetch --depth=1 origin +{commit}:refs/remotes/origin/{branch}"
            ),
            format!("git checkout --progress --force -B {branch} refs/remotes/origin/{branch}"),
        ];

        // The auth header must never reach the captured logs.
        let secrets: HashMap<String, String> =
            [("OAUTH_TOKEN".to_string(), oauth.access_token.clone())]
                .into_iter()
                .collect();

        for command in &commands {
            debug!(command = %mask_secrets(command, &secrets), "git setup");
            run_shell_command(cancel, command, &self.repo_root, &[], &secrets).await?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct CacheRequest<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    paths: Option<&'a [String]>,
}

/// Cache and workspace blob transport via the in-container sidecar.
pub struct SidecarCacheStore {
    inner: reqwest::Client,
    base_url: String,
}

impl SidecarCacheStore {
    pub fn new(base_url: &str) -> Result<Self, AgentError> {
        Ok(Self {
            inner: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(
        &self,
        cancel: &CancellationToken,
        path: &str,
        body: &CacheRequest<'_>,
        missing_ok: bool,
    ) -> Result<(), AgentError> {
        let url = format!("{}{path}", self.base_url);
        let request = self.inner.post(&url).json(body).send();
        let response = with_cancel(cancel, async {
            request
                .await
                .map_err(|e| AgentError::internal(format!("sidecar request to {url} failed: {e}")))
        })
        .await?;

        if missing_ok && response.status() == reqwest::StatusCode::NOT_FOUND {
            info!(key = body.key, "no cache blob for key, starting cold");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(AgentError::internal(format!(
                "sidecar returned status {} for {path}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for SidecarCacheStore {
    async fn download(&self, cancel: &CancellationToken, key: &str) -> Result<(), AgentError> {
        self.post(cancel, "/cache/download", &CacheRequest { key, paths: None }, true)
            .await
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        paths: &[String],
    ) -> Result<(), AgentError> {
        self.post(
            cancel,
            "/cache/upload",
            &CacheRequest {
                key,
                paths: Some(paths),
            },
            false,
        )
        .await
    }

    async fn cache_workspace(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        self.post(
            cancel,
            "/workspace/persist",
            &CacheRequest { key: "", paths: None },
            false,
        )
        .await
    }

    async fn extract_workspace(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        self.post(
            cancel,
            "/workspace/extract",
            &CacheRequest { key: "", paths: None },
            false,
        )
        .await
    }
}

/// Loads the repository's test configuration from its YAML file.
pub struct YamlConfigManager {
    repo_root: PathBuf,
}

impl YamlConfigManager {
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    async fn read(&self, filename: &str) -> Result<String, AgentError> {
        tokio::fs::read_to_string(self.repo_root.join(filename))
            .await
            .map_err(|e| {
                AgentError::failed(format!("unable to read configuration file `{filename}`: {e}"))
            })
    }
}

#[async_trait]
impl ConfigManager for YamlConfigManager {
    async fn get_version(&self, filename: &str) -> Result<u32, AgentError> {
        let content = self.read(filename).await?;
        let value: serde_yaml::Value = serde_yaml::from_str(&content).map_err(|_| {
            AgentError::failed(format!(
                "`{filename}` configuration file contains invalid format"
            ))
        })?;

        let version = match value.get("version") {
            Some(serde_yaml::Value::String(s)) => s.clone(),
            Some(serde_yaml::Value::Number(n)) => n.to_string(),
            _ => {
                return Err(AgentError::failed(format!(
                    "`{filename}` configuration file does not declare a version"
                )))
            }
        };
        parse_major_version(&version)
    }

    async fn load_and_validate_v1(
        &self,
        filename: &str,
        _event_type: EventType,
        _tier: &str,
    ) -> Result<TasConfig, AgentError> {
        let content = self.read(filename).await?;
        let config: TasConfig = serde_yaml::from_str(&content).map_err(|_| {
            AgentError::failed(format!(
                "`{filename}` configuration file contains invalid format"
            ))
        })?;
        // The framework decides which runner binary we dispatch to.
        framework_runner(&config.framework)?;
        Ok(config)
    }

    async fn load_and_validate_v2(
        &self,
        filename: &str,
        _event_type: EventType,
        _tier: &str,
    ) -> Result<TasConfigV2, AgentError> {
        let content = self.read(filename).await?;
        let config: TasConfigV2 = serde_yaml::from_str(&content).map_err(|_| {
            AgentError::failed(format!(
                "`{filename}` configuration file contains invalid format"
            ))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Reads mounted secret files.
pub struct FileSecretProvider;

impl SecretProvider for FileSecretProvider {
    fn oauth_secret(&self, path: &Path) -> Result<Oauth, AgentError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::internal(format!("failed to read oauth secret: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| AgentError::internal(format!("invalid oauth secret: {e}")))
    }

    fn repo_secrets(&self, path: &Path) -> Result<HashMap<String, String>, AgentError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::internal(format!("failed to read repo secrets: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| AgentError::internal(format!("invalid repo secrets: {e}")))
    }
}

/// Fetches the changed-file diff from the report API.
pub struct HttpDiffProvider {
    inner: reqwest::Client,
    base_url: String,
}

impl HttpDiffProvider {
    pub fn new(base_url: &str) -> Result<Self, AgentError> {
        Ok(Self {
            inner: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DiffProvider for HttpDiffProvider {
    async fn changed_files(
        &self,
        cancel: &CancellationToken,
        payload: &BuildPayload,
        oauth: &Oauth,
    ) -> Result<Diff, AgentError> {
        let url = format!("{}/diff", self.base_url);
        let request = self
            .inner
            .get(&url)
            .query(&[
                ("repo_id", payload.repo_id.as_str()),
                ("commit", payload.build_target_commit.as_str()),
            ])
            .bearer_auth(&oauth.access_token)
            .send();
        let response = with_cancel(cancel, async {
            request
                .await
                .map_err(|e| AgentError::internal(format!("diff fetch failed: {e}")))
        })
        .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AgentError::DiffNotFound);
        }
        if !response.status().is_success() {
            return Err(AgentError::internal(format!(
                "diff fetch returned status {}",
                response.status()
            )));
        }
        response
            .json::<Diff>()
            .await
            .map_err(|e| AgentError::internal(format!("invalid diff body: {e}")))
    }
}

#[derive(Serialize)]
struct BlocklistRequest<'a> {
    repo_id: &'a str,
    branch: &'a str,
    source: &'a str,
}

/// Resolves the blocklist against the report API and materializes it for
/// the runners.
pub struct HttpBlockTestService {
    inner: reqwest::Client,
    base_url: String,
    block_tests_file: PathBuf,
}

impl HttpBlockTestService {
    pub fn new(base_url: &str, block_tests_file: PathBuf) -> Result<Self, AgentError> {
        Ok(Self {
            inner: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            block_tests_file,
        })
    }
}

#[async_trait]
impl BlockTestService for HttpBlockTestService {
    fn blocklist_source_v1(&self, config: &TasConfig) -> String {
        serde_json::to_string(&config.blocklist).unwrap_or_default()
    }

    fn blocklist_source_v2(&self, submodule: &Submodule) -> String {
        serde_json::to_string(&submodule.blocklist).unwrap_or_default()
    }

    async fn fetch_block_tests(
        &self,
        cancel: &CancellationToken,
        source: &str,
        repo_id: &str,
        branch: &str,
    ) -> Result<(), AgentError> {
        let url = format!("{}/blocklist", self.base_url);
        let request = self
            .inner
            .post(&url)
            .json(&BlocklistRequest {
                repo_id,
                branch,
                source,
            })
            .send();
        let response = with_cancel(cancel, async {
            request
                .await
                .map_err(|e| AgentError::internal(format!("blocklist fetch failed: {e}")))
        })
        .await?;

        if !response.status().is_success() {
            return Err(AgentError::internal(format!(
                "blocklist fetch returned status {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| AgentError::internal(format!("invalid blocklist body: {e}")))?;
        tokio::fs::write(&self.block_tests_file, &body)
            .await
            .map_err(|e| AgentError::internal(format!("failed to write blocklist file: {e}")))?;
        Ok(())
    }
}

#[derive(Serialize)]
struct CoverageRequest<'a> {
    org_id: &'a str,
    repo_id: &'a str,
    commit_id: &'a str,
}

/// Coverage merge/upload via the in-container sidecar.
pub struct SidecarCoverageManager {
    inner: reqwest::Client,
    base_url: String,
}

impl SidecarCoverageManager {
    pub fn new(base_url: &str) -> Result<Self, AgentError> {
        Ok(Self {
            inner: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CoverageManager for SidecarCoverageManager {
    async fn merge_and_upload(
        &self,
        cancel: &CancellationToken,
        payload: &BuildPayload,
    ) -> Result<(), AgentError> {
        let url = format!("{}/coverage/merge", self.base_url);
        let request = self
            .inner
            .post(&url)
            .json(&CoverageRequest {
                org_id: &payload.org_id,
                repo_id: &payload.repo_id,
                commit_id: &payload.build_target_commit,
            })
            .send();
        let response = with_cancel(cancel, async {
            request
                .await
                .map_err(|e| AgentError::internal(format!("coverage merge failed: {e}")))
        })
        .await?;

        if !response.status().is_success() {
            return Err(AgentError::internal(format!(
                "coverage merge returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Runs previously discovered tests through the framework runner and
/// reports the stats the collector extracted.
pub struct RunnerExecutionService {
    collector: Arc<dyn ResultCollector>,
    report: Arc<ReportClient>,
}

impl RunnerExecutionService {
    pub fn new(collector: Arc<dyn ResultCollector>, report: Arc<ReportClient>) -> Self {
        Self { collector, report }
    }
}

#[async_trait]
impl TestExecutionService for RunnerExecutionService {
    async fn run(
        &self,
        cancel: &CancellationToken,
        config: &TasConfig,
        payload: &BuildPayload,
        secrets: &HashMap<String, String>,
        run_context: &RunContext,
    ) -> Result<ExecutionResults, AgentError> {
        let runner = framework_runner(&config.framework)?;

        let mut args = vec!["--command".to_string(), "execute".to_string()];
        if !config.config_file.is_empty() {
            args.push("--config".to_string());
            args.push(config.config_file.clone());
        }

        let merge = config.merge_for(payload.event_type == EventType::PullRequest);
        let env_overlay = merge.map(|m| m.env.clone()).unwrap_or_default();
        let env = merged_env(run_context, &env_overlay, secrets);

        // Fresh slot before the spawn, received only after exit - same
        // rendezvous contract as discovery.
        let slot = self.collector.execution_slot();

        info!(runner = runner, "executing tests");
        let mut cmd = Command::new(runner);
        cmd.args(&args)
            .current_dir(&run_context.repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            spawn_masked_pump(stdout, secrets.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_masked_pump(stderr, secrets.clone(), "stderr");
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill execution runner on cancel");
                }
                return Err(AgentError::Aborted);
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            return Err(AgentError::internal(format!(
                "execution runner exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }

        slot.receive(POST_EXIT_DEADLINE).await
    }

    async fn send_results(
        &self,
        results: &ExecutionResults,
    ) -> Result<ExecutionResponse, AgentError> {
        self.report.send_stats(results).await
    }
}
