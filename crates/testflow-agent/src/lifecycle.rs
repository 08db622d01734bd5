//! Task lifecycle controller.
//!
//! Owns the run from payload fetch to terminal status report. The
//! controlled phase runs in its own task; whatever comes back - value,
//! error or panic - is classified once and reported exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use testflow_core::{
    classify, AgentError, BuildPayload, Diff, EventType, Oauth, RunOutcome, Status, TaskRun,
};

use crate::cache::cache_key;
use crate::collaborators::{
    BlockTestService, CacheStore, CommandKind, ConfigManager, CoverageManager, DiffProvider,
    ExecutionManager, GitManager, PayloadManager, SecretProvider, TaskStatusReporter,
    TestExecutionService,
};
use crate::config::{Config, RunMode};
use crate::context::{RunContext, INSTALL_RUNNER_CMDS};
use crate::discovery::{DiscoverTarget, TestDiscovery};
use crate::submodule::{FailurePolicy, SubmoduleCoordinator};

/// The seams the controller drives.
pub struct Collaborators {
    pub payload_manager: Arc<dyn PayloadManager>,
    pub git: Arc<dyn GitManager>,
    pub cache: Arc<dyn CacheStore>,
    pub config_manager: Arc<dyn ConfigManager>,
    pub exec: Arc<dyn ExecutionManager>,
    pub status_reporter: Arc<dyn TaskStatusReporter>,
    pub diff_provider: Arc<dyn DiffProvider>,
    pub secrets: Arc<dyn SecretProvider>,
    pub blocklist: Arc<dyn BlockTestService>,
    pub coverage: Arc<dyn CoverageManager>,
    pub execution: Arc<dyn TestExecutionService>,
    pub discovery: Arc<TestDiscovery>,
}

/// Top-level state machine for one agent run.
pub struct Lifecycle {
    config: Arc<Config>,
    collab: Collaborators,
    coordinator: Arc<SubmoduleCoordinator>,
}

impl Lifecycle {
    pub fn new(config: Arc<Config>, collab: Collaborators, policy: FailurePolicy) -> Self {
        let coordinator = Arc::new(SubmoduleCoordinator::new(
            Arc::clone(&collab.discovery),
            Arc::clone(&collab.exec),
            Arc::clone(&collab.blocklist),
            policy,
        ));
        Self {
            config,
            collab,
            coordinator,
        }
    }

    /// Drive the run to a terminal status.
    ///
    /// Payload fetch/validation and the initial running-status report are
    /// fatal: they return immediately with no status report. Everything
    /// after runs in the controlled phase whose outcome - including a
    /// recovered panic - is classified and reported exactly once.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), AgentError> {
        let started_at = Utc::now();
        info!("starting task lifecycle");

        let mut payload = self
            .collab
            .payload_manager
            .fetch_payload(&self.config.payload_address)
            .await?;
        self.collab.payload_manager.validate_payload(&payload)?;
        debug!(task_id = %payload.task_id, build_id = %payload.build_id, "payload validated");

        if self.config.mode == RunMode::Coverage {
            self.collab
                .coverage
                .merge_and_upload(&cancel, &payload)
                .await?;
            info!("coverage merge and upload completed");
            return Ok(());
        }
        let task_type = match self.config.mode.task_type() {
            Some(task_type) => task_type,
            None => return Ok(()),
        };
        payload.task_type = Some(task_type);
        info!(mode = ?task_type, "running agent");

        let mut task_run = TaskRun::new(&payload, task_type, started_at);
        self.collab.status_reporter.update_status(&task_run).await?;

        let this = Arc::clone(&self);
        let phase_payload = payload.clone();
        let phase_cancel = cancel.clone();
        let handle =
            tokio::spawn(async move { this.run_phases(phase_cancel, phase_payload).await });

        let outcome = match handle.await {
            Ok(Ok((status, remark))) => RunOutcome::Completed { status, remark },
            Ok(Err(err)) => RunOutcome::Errored(err),
            Err(join_err) => {
                let panic_msg = if join_err.is_panic() {
                    let panic = join_err.into_panic();
                    panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic payload".to_string())
                } else {
                    join_err.to_string()
                };
                error!(panic = %panic_msg, "recovered panic in run phase");
                RunOutcome::Panicked
            }
        };

        let (status, remark) = classify(&outcome);
        task_run.finalize(status, remark, Utc::now());
        info!(status = ?status, "finalizing task");
        if let Err(report_err) = self.collab.status_reporter.update_status(&task_run).await {
            error!(error = %report_err, "failed to report terminal task status");
            return Err(report_err);
        }

        match outcome {
            RunOutcome::Errored(err) => Err(err),
            _ => Ok(()),
        }
    }

    /// The controlled phase: secrets, workspace, config resolution, then
    /// the version-routed dispatch. Returns the completed status (and
    /// optional remark) the finalizer reports on success.
    async fn run_phases(
        &self,
        cancel: CancellationToken,
        payload: BuildPayload,
    ) -> Result<(Status, Option<String>), AgentError> {
        // Secrets strictly before workspace acquisition.
        let oauth = self
            .collab
            .secrets
            .oauth_secret(&self.config.oauth_secret_path)
            .map_err(|e| {
                error!(error = %e, "failed to read oauth secret");
                e
            })?;
        let secret_map = self
            .collab
            .secrets
            .repo_secrets(&self.config.repo_secret_path)
            .map_err(|e| AgentError::internal(format!("failed to read repo secrets: {e}")))?;

        if self.config.mode == RunMode::Discover {
            info!(repo = %payload.repo_link, "cloning repository");
            self.collab
                .git
                .clone_repo(&cancel, &payload, &oauth)
                .await
                .map_err(|e| match e {
                    AgentError::Aborted => AgentError::Aborted,
                    _ => AgentError::failed(format!("Unable to clone repo: {}", payload.repo_link)),
                })?;
        } else {
            debug!("extracting workspace");
            self.collab
                .cache
                .extract_workspace(&cancel)
                .await
                .map_err(|e| match e {
                    AgentError::Aborted => AgentError::Aborted,
                    other => {
                        AgentError::internal(format!("workspace extraction failed: {other}"))
                    }
                })?;
        }

        let coverage_dir = self
            .config
            .coverage_base_dir
            .join(&payload.org_id)
            .join(&payload.repo_id)
            .join(&payload.build_target_commit);
        if payload.collect_coverage {
            tokio::fs::create_dir_all(&coverage_dir).await.map_err(|e| {
                AgentError::internal(format!("failed to create coverage directory: {e}"))
            })?;
        }

        let version = self
            .collab
            .config_manager
            .get_version(&payload.config_file_name)
            .await
            .map_err(|e| match e {
                AgentError::Aborted => AgentError::Aborted,
                other => AgentError::failed(other.to_string()),
            })?;

        // The environment every subprocess depends on, built before the
        // first spawn and only read afterwards.
        let mut run_context = RunContext::new(&self.config, &payload, &coverage_dir);

        if version >= 2 {
            self.run_v2(&cancel, &payload, &secret_map, &oauth, &run_context)
                .await
        } else {
            self.run_v1(&cancel, &payload, &secret_map, &oauth, &mut run_context)
                .await
        }
    }

    /// Legacy single-module path.
    async fn run_v1(
        &self,
        cancel: &CancellationToken,
        payload: &BuildPayload,
        secrets: &HashMap<String, String>,
        oauth: &Oauth,
        run_context: &mut RunContext,
    ) -> Result<(Status, Option<String>), AgentError> {
        let tas_config = self
            .collab
            .config_manager
            .load_and_validate_v1(
                &payload.config_file_name,
                payload.event_type,
                &payload.license_tier,
            )
            .await
            .map_err(|e| match e {
                AgentError::Aborted => AgentError::Aborted,
                other => AgentError::failed(other.to_string()),
            })?;

        let key = cache_key(&payload.org_id, &payload.repo_id, &tas_config.cache.key);

        if !tas_config.node_version.is_empty() {
            self.install_node_version(cancel, &tas_config.node_version, run_context)
                .await?;
        }

        let mut status = Status::Passed;
        let mut remark = None;

        if self.config.mode == RunMode::Discover {
            let source = self.collab.blocklist.blocklist_source_v1(&tas_config);
            self.collab
                .blocklist
                .fetch_block_tests(cancel, &source, &payload.repo_id, &payload.branch_name)
                .await
                .map_err(|e| match e {
                    AgentError::Aborted => AgentError::Aborted,
                    other => AgentError::internal(format!("blocklist resolution failed: {other}")),
                })?;

            self.collab
                .cache
                .download(cancel, &key)
                .await
                .map_err(|e| match e {
                    AgentError::Aborted => AgentError::Aborted,
                    other => AgentError::internal(format!("cache download failed: {other}")),
                })?;

            if let Some(pre_run) = &tas_config.pre_run {
                info!("running pre-run steps");
                let repo_root = run_context.repo_root.clone();
                self.collab
                    .exec
                    .execute_user_commands(
                        cancel,
                        CommandKind::PreRun,
                        pre_run,
                        secrets,
                        &repo_root,
                        run_context,
                    )
                    .await
                    .map_err(|e| match e {
                        AgentError::Aborted => AgentError::Aborted,
                        _ => AgentError::failed("Failed in running pre-run steps"),
                    })?;
            }

            let install_cmds: Vec<String> =
                INSTALL_RUNNER_CMDS.iter().map(|c| c.to_string()).collect();
            let repo_root = run_context.repo_root.clone();
            self.collab
                .exec
                .execute_internal_commands(
                    cancel,
                    CommandKind::InstallRunners,
                    &install_cmds,
                    &repo_root,
                    run_context,
                )
                .await
                .map_err(|e| match e {
                    AgentError::Aborted => AgentError::Aborted,
                    other => AgentError::internal(format!("runner install failed: {other}")),
                })?;

            debug!("caching workspace");
            self.collab
                .cache
                .cache_workspace(cancel)
                .await
                .map_err(|e| match e {
                    AgentError::Aborted => AgentError::Aborted,
                    other => AgentError::internal(format!("workspace caching failed: {other}")),
                })?;

            info!("identifying changed files");
            let (diff, diff_exists) = self.changed_files(cancel, payload, oauth).await?;

            let merge = tas_config.merge_for(payload.event_type == EventType::PullRequest);
            let (patterns, env_overlay) = merge
                .map(|m| (m.patterns.clone(), m.env.clone()))
                .unwrap_or_default();

            let target = DiscoverTarget {
                framework: tas_config.framework.clone(),
                patterns,
                module_config_file: tas_config.config_file.clone(),
                repo_config_file: payload.config_file_name.clone(),
                smart_run: tas_config.smart_run,
                working_dir: run_context.repo_root.clone(),
                env_overlay,
                parallelism: tas_config.parallelism,
                split_mode: tas_config.split_mode,
                tier: tas_config.tier.clone(),
                container_image: tas_config.container_image.clone(),
                submodule: None,
            };
            self.collab
                .discovery
                .discover(cancel, &target, secrets, &diff, diff_exists, run_context)
                .await
                .map_err(|e| match e {
                    AgentError::Aborted => AgentError::Aborted,
                    AgentError::StatusFailed { remark } => AgentError::StatusFailed { remark },
                    _ => AgentError::failed("Failed in discovering tests"),
                })?;

            // One upload, after the workspace is persisted.
            self.collab
                .cache
                .upload(cancel, &key, &tas_config.cache.paths)
                .await
                .map_err(|e| match e {
                    AgentError::Aborted => AgentError::Aborted,
                    other => AgentError::internal(format!("cache upload failed: {other}")),
                })?;
            debug!("cache uploaded successfully");
        }

        if self.config.mode.is_execution() {
            let results = self
                .collab
                .execution
                .run(cancel, &tas_config, payload, secrets, run_context)
                .await
                .map_err(|e| match e {
                    AgentError::Aborted => AgentError::Aborted,
                    _ => AgentError::failed("Failed in executing tests"),
                })?;

            let response = self
                .collab
                .execution
                .send_results(&results)
                .await
                .map_err(|e| match e {
                    AgentError::Aborted => AgentError::Aborted,
                    other => AgentError::internal(format!("failed to send results: {other}")),
                })?;
            status = response.task_status;
            remark = response.remark;

            if let Some(post_run) = &tas_config.post_run {
                info!("running post-run steps");
                let repo_root = run_context.repo_root.clone();
                self.collab
                    .exec
                    .execute_user_commands(
                        cancel,
                        CommandKind::PostRun,
                        post_run,
                        secrets,
                        &repo_root,
                        run_context,
                    )
                    .await
                    .map_err(|e| match e {
                        AgentError::Aborted => AgentError::Aborted,
                        _ => AgentError::failed("Failed in running post-run steps"),
                    })?;
            }
        }

        debug!("completed lifecycle phase");
        Ok((status, remark))
    }

    /// Submodule-aware path (schema v2). Only discovery is defined for v2
    /// configs; the other modes are a quiet success.
    async fn run_v2(
        &self,
        cancel: &CancellationToken,
        payload: &BuildPayload,
        secrets: &HashMap<String, String>,
        oauth: &Oauth,
        run_context: &RunContext,
    ) -> Result<(Status, Option<String>), AgentError> {
        let tas_config = self
            .collab
            .config_manager
            .load_and_validate_v2(
                &payload.config_file_name,
                payload.event_type,
                &payload.license_tier,
            )
            .await
            .map_err(|e| match e {
                AgentError::Aborted => AgentError::Aborted,
                other => AgentError::failed(other.to_string()),
            })?;

        if self.config.mode != RunMode::Discover {
            info!("no execution path for v2 configs in this agent; nothing to do");
            return Ok((Status::Passed, None));
        }

        let key = cache_key(&payload.org_id, &payload.repo_id, &tas_config.cache.key);
        self.collab
            .cache
            .download(cancel, &key)
            .await
            .map_err(|e| match e {
                AgentError::Aborted => AgentError::Aborted,
                other => AgentError::internal(format!("cache download failed: {other}")),
            })?;

        info!("identifying changed files");
        let (diff, diff_exists) = self.changed_files(cancel, payload, oauth).await?;

        let outcomes = self
            .coordinator
            .run_discovery(
                cancel,
                payload,
                &tas_config,
                secrets,
                Arc::new(diff),
                diff_exists,
                run_context,
            )
            .await?;
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        if failed > 0 {
            warn!(
                failed = failed,
                total = outcomes.len(),
                "submodule discovery completed with failures"
            );
        }

        debug!("caching workspace");
        self.collab
            .cache
            .cache_workspace(cancel)
            .await
            .map_err(|e| match e {
                AgentError::Aborted => AgentError::Aborted,
                other => AgentError::internal(format!("workspace caching failed: {other}")),
            })?;

        // One upload, after every submodule has signalled completion.
        self.collab
            .cache
            .upload(cancel, &key, &tas_config.cache.paths)
            .await
            .map_err(|e| match e {
                AgentError::Aborted => AgentError::Aborted,
                other => AgentError::internal(format!("cache upload failed: {other}")),
            })?;
        debug!("cache uploaded successfully");

        Ok((Status::Passed, None))
    }

    /// Diff with the recoverable missing-diff fallback: a distinguished
    /// not-found becomes `diff_exists = false` and full discovery.
    async fn changed_files(
        &self,
        cancel: &CancellationToken,
        payload: &BuildPayload,
        oauth: &Oauth,
    ) -> Result<(Diff, bool), AgentError> {
        match self
            .collab
            .diff_provider
            .changed_files(cancel, payload, oauth)
            .await
        {
            Ok(diff) => Ok((diff, true)),
            Err(AgentError::DiffNotFound) => {
                info!("no diff available for this build, discovering all tests");
                Ok((Diff::new(), false))
            }
            Err(AgentError::Aborted) => Err(AgentError::Aborted),
            Err(e) => {
                error!(error = %e, "unable to identify changed files");
                Err(AgentError::internal(
                    "error occurred in fetching diff from the git provider",
                ))
            }
        }
    }

    /// Install the user-pinned node toolchain and overlay its bin dir onto
    /// the PATH subsequent subprocesses see.
    async fn install_node_version(
        &self,
        cancel: &CancellationToken,
        version: &str,
        run_context: &mut RunContext,
    ) -> Result<(), AgentError> {
        info!(version = version, "using user-defined node version");
        let commands = vec![format!(
            ". /home/testflow/.nvm/nvm.sh && nvm install {version}"
        )];
        self.collab
            .exec
            .execute_internal_commands(
                cancel,
                CommandKind::InstallNode,
                &commands,
                &std::env::temp_dir(),
                run_context,
            )
            .await
            .map_err(|e| match e {
                AgentError::Aborted => AgentError::Aborted,
                other => AgentError::internal(format!("node install failed: {other}")),
            })?;
        run_context.prepend_path(format!("/home/testflow/.nvm/versions/node/v{version}/bin"));
        Ok(())
    }
}
