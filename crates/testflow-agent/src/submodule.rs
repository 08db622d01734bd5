//! Submodule discovery coordinator (schema v2).
//!
//! Fans the discovery dispatcher out across the configured submodules and
//! joins every task before the caller proceeds to workspace persistence.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use testflow_core::{AgentError, BuildPayload, Diff, EventType, Submodule, TasConfigV2};

use crate::collaborators::{BlockTestService, CommandKind, ExecutionManager};
use crate::context::{RunContext, INSTALL_RUNNER_CMDS};
use crate::discovery::{DiscoverTarget, TestDiscovery};

/// What a failing submodule does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failure, let siblings finish, leave the run status alone.
    BestEffort,
    /// Still wait for every sibling, then surface the first failure.
    FailFast,
}

/// Completion record of one submodule task.
#[derive(Debug)]
pub struct SubmoduleOutcome {
    pub submodule: String,
    pub result: Result<(), AgentError>,
}

/// Inputs shared read-only by every submodule task.
struct JobShared {
    cancel: CancellationToken,
    repo_config_file: String,
    smart_run: bool,
    split_mode: testflow_core::SplitMode,
    tier: String,
    container_image: String,
    shared_parallelism: u32,
    merge_env: HashMap<String, String>,
    secrets: HashMap<String, String>,
    diff: Arc<Diff>,
    diff_exists: bool,
    run_context: RunContext,
    repo_id: String,
    branch: String,
}

/// Coordinates concurrent per-submodule discovery.
pub struct SubmoduleCoordinator {
    discovery: Arc<TestDiscovery>,
    exec: Arc<dyn ExecutionManager>,
    blocklist: Arc<dyn BlockTestService>,
    policy: FailurePolicy,
}

impl SubmoduleCoordinator {
    pub fn new(
        discovery: Arc<TestDiscovery>,
        exec: Arc<dyn ExecutionManager>,
        blocklist: Arc<dyn BlockTestService>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            discovery,
            exec,
            blocklist,
            policy,
        }
    }

    /// Fan out one discovery task per configured submodule and join them
    /// all. Push events discover the post-merge list, pull requests the
    /// pre-merge list - never both in one run.
    pub async fn run_discovery(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        payload: &BuildPayload,
        config: &TasConfigV2,
        secrets: &HashMap<String, String>,
        diff: Arc<Diff>,
        diff_exists: bool,
        run_context: &RunContext,
    ) -> Result<Vec<SubmoduleOutcome>, AgentError> {
        let merge = match payload.event_type {
            EventType::Push => &config.post_merge,
            EventType::PullRequest => &config.pre_merge,
        };

        let shared = Arc::new(JobShared {
            cancel: cancel.clone(),
            repo_config_file: payload.config_file_name.clone(),
            smart_run: config.smart_run,
            split_mode: config.split_mode,
            tier: config.tier.clone(),
            container_image: config.container_image.clone(),
            shared_parallelism: config.parallelism,
            merge_env: merge.env.clone(),
            secrets: secrets.clone(),
            diff,
            diff_exists,
            run_context: run_context.clone(),
            repo_id: payload.repo_id.clone(),
            branch: payload.branch_name.clone(),
        });

        info!(
            submodules = merge.submodules.len(),
            event = ?payload.event_type,
            "starting submodule discovery"
        );

        let mut tasks = JoinSet::new();
        for submodule in &merge.submodules {
            let this = Arc::clone(self);
            let shared = Arc::clone(&shared);
            let submodule = submodule.clone();
            tasks.spawn(async move {
                let name = submodule.name.clone();
                let result = this.run_one(&shared, &submodule).await;
                SubmoduleOutcome {
                    submodule: name,
                    result,
                }
            });
        }

        // Completion barrier: every submodule signals exactly once,
        // failures included, before the caller may persist the workspace.
        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => {
                    error!(error = %join_err, "submodule task died before signalling");
                    outcomes.push(SubmoduleOutcome {
                        submodule: "(unknown)".to_string(),
                        result: Err(AgentError::internal(format!(
                            "submodule task failed to join: {join_err}"
                        ))),
                    });
                }
            }
        }

        for outcome in &outcomes {
            if let Err(err) = &outcome.result {
                warn!(
                    submodule = %outcome.submodule,
                    error = %err,
                    "submodule discovery failed"
                );
            }
        }

        if self.policy == FailurePolicy::FailFast {
            for outcome in &outcomes {
                if let Err(err) = &outcome.result {
                    return Err(AgentError::failed(format!(
                        "submodule {} failed: {err}",
                        outcome.submodule
                    )));
                }
            }
        }

        Ok(outcomes)
    }

    /// One submodule: blocklist, pre-run, runner tooling, then dispatch.
    async fn run_one(&self, shared: &JobShared, submodule: &Submodule) -> Result<(), AgentError> {
        let source = self.blocklist.blocklist_source_v2(submodule);
        self.blocklist
            .fetch_block_tests(&shared.cancel, &source, &shared.repo_id, &shared.branch)
            .await
            .map_err(|e| match e {
                AgentError::Aborted => AgentError::Aborted,
                other => AgentError::internal(format!("blocklist resolution failed: {other}")),
            })?;

        let working_dir = shared.run_context.repo_root.join(&submodule.path);

        if let Some(pre_run) = &submodule.pre_run {
            info!(submodule = %submodule.name, "running pre-run steps");
            self.exec
                .execute_user_commands(
                    &shared.cancel,
                    CommandKind::PreRun,
                    pre_run,
                    &shared.secrets,
                    &working_dir,
                    &shared.run_context,
                )
                .await
                .map_err(|e| match e {
                    AgentError::Aborted => AgentError::Aborted,
                    _ => AgentError::failed("Failed in running pre-run steps"),
                })?;
        }

        let install_cmds: Vec<String> = INSTALL_RUNNER_CMDS.iter().map(|c| c.to_string()).collect();
        self.exec
            .execute_internal_commands(
                &shared.cancel,
                CommandKind::InstallRunners,
                &install_cmds,
                &working_dir,
                &shared.run_context,
            )
            .await
            .map_err(|e| match e {
                AgentError::Aborted => AgentError::Aborted,
                other => AgentError::internal(format!("runner install failed: {other}")),
            })?;

        // Merge-level env with the submodule overlay on top.
        let mut env_overlay = shared.merge_env.clone();
        for (key, value) in &submodule.env {
            env_overlay.insert(key.clone(), value.clone());
        }

        let target = DiscoverTarget {
            framework: submodule.framework.clone(),
            patterns: submodule.patterns.clone(),
            module_config_file: submodule.config_file.clone(),
            repo_config_file: shared.repo_config_file.clone(),
            smart_run: shared.smart_run,
            working_dir,
            env_overlay,
            parallelism: submodule.parallelism.unwrap_or(shared.shared_parallelism),
            split_mode: shared.split_mode,
            tier: shared.tier.clone(),
            container_image: shared.container_image.clone(),
            submodule: Some(submodule.name.clone()),
        };

        self.discovery
            .discover(
                &shared.cancel,
                &target,
                &shared.secrets,
                &shared.diff,
                shared.diff_exists,
                &shared.run_context,
            )
            .await
            .map_err(|e| match e {
                AgentError::Aborted => AgentError::Aborted,
                AgentError::StatusFailed { remark } => AgentError::StatusFailed { remark },
                _ => AgentError::failed("Failed in discovering tests"),
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use clap::Parser;
    use tempfile::TempDir;
    use testflow_core::{
        CommandBlock, DiscoveryResult, EventType, GitProvider, MergeV2, TasConfig,
    };

    use crate::collaborators::IngestReporter;
    use crate::config::Config;
    use crate::rendezvous::ResultBus;

    struct NullReporter;

    #[async_trait]
    impl IngestReporter for NullReporter {
        async fn report_discovery(&self, _result: &DiscoveryResult) -> Result<(), AgentError> {
            Ok(())
        }
    }

    /// Execution manager that fails pre-run steps for submodules whose
    /// working directory ends with "bad".
    struct FailingPreRunExec;

    #[async_trait]
    impl ExecutionManager for FailingPreRunExec {
        async fn execute_user_commands(
            &self,
            _cancel: &CancellationToken,
            _kind: CommandKind,
            _block: &CommandBlock,
            _secrets: &HashMap<String, String>,
            cwd: &Path,
            _run_context: &RunContext,
        ) -> Result<(), AgentError> {
            if cwd.ends_with("bad") {
                return Err(AgentError::internal("pre-run exploded"));
            }
            Ok(())
        }

        async fn execute_internal_commands(
            &self,
            _cancel: &CancellationToken,
            _kind: CommandKind,
            _commands: &[String],
            _cwd: &Path,
            _run_context: &RunContext,
        ) -> Result<(), AgentError> {
            Ok(())
        }
    }

    struct RecordingBlocklist {
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BlockTestService for RecordingBlocklist {
        fn blocklist_source_v1(&self, _config: &TasConfig) -> String {
            String::new()
        }

        fn blocklist_source_v2(&self, submodule: &Submodule) -> String {
            submodule.name.clone()
        }

        async fn fetch_block_tests(
            &self,
            _cancel: &CancellationToken,
            source: &str,
            _repo_id: &str,
            _branch: &str,
        ) -> Result<(), AgentError> {
            self.fetched.lock().unwrap().push(source.to_string());
            Ok(())
        }
    }

    fn write_runner(dir: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("jest-runner");
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn submodule(name: &str, pre_run: bool) -> Submodule {
        Submodule {
            name: name.to_string(),
            path: name.to_string(),
            patterns: vec!["**/*.test.ts".to_string()],
            framework: "jest".to_string(),
            config_file: String::new(),
            env: HashMap::new(),
            pre_run: pre_run.then(|| CommandBlock {
                commands: vec!["true".to_string()],
                env: HashMap::new(),
            }),
            blocklist: Vec::new(),
            parallelism: None,
        }
    }

    fn payload(event_type: EventType) -> BuildPayload {
        BuildPayload {
            task_id: "task-1".to_string(),
            build_id: "build-1".to_string(),
            org_id: "org-1".to_string(),
            repo_id: "repo-1".to_string(),
            repo_slug: "acme/widgets".to_string(),
            repo_link: "https://github.com/acme/widgets".to_string(),
            fork_slug: String::new(),
            git_provider: GitProvider::Github,
            event_type,
            build_target_commit: "abc123".to_string(),
            branch_name: "main".to_string(),
            license_tier: "small".to_string(),
            collect_coverage: false,
            config_file_name: ".testflow.yml".to_string(),
            task_type: None,
        }
    }

    struct Fixture {
        coordinator: Arc<SubmoduleCoordinator>,
        bus: Arc<ResultBus>,
        blocklist: Arc<RecordingBlocklist>,
        _bin: TempDir,
        repo_root: TempDir,
    }

    fn fixture(policy: FailurePolicy) -> Fixture {
        let bin = TempDir::new().unwrap();
        let repo_root = TempDir::new().unwrap();
        write_runner(bin.path());

        let bus = Arc::new(ResultBus::new());
        let discovery = Arc::new(TestDiscovery::new(bus.clone(), Arc::new(NullReporter)));
        let blocklist = Arc::new(RecordingBlocklist {
            fetched: Mutex::new(Vec::new()),
        });
        let coordinator = Arc::new(SubmoduleCoordinator::new(
            discovery,
            Arc::new(FailingPreRunExec),
            blocklist.clone(),
            policy,
        ));

        Fixture {
            coordinator,
            bus,
            blocklist,
            _bin: bin,
            repo_root,
        }
    }

    fn run_context(fixture: &Fixture) -> RunContext {
        let config = Config::parse_from([
            "testflow-agent",
            "--repo-root",
            fixture.repo_root.path().to_str().unwrap(),
        ]);
        let mut ctx = RunContext::new(&config, &payload(EventType::Push), Path::new("/tmp/cov"));
        ctx.prepend_path(fixture._bin.path());
        ctx
    }

    fn config_with(submodules: Vec<Submodule>) -> TasConfigV2 {
        TasConfigV2 {
            post_merge: MergeV2 {
                submodules,
                env: HashMap::new(),
            },
            parallelism: 2,
            ..TasConfigV2::default()
        }
    }

    /// Publishes one discovery result per expected good submodule, giving
    /// every task time to take its slot first.
    fn publish_results(bus: &Arc<ResultBus>, count: usize) {
        let bus = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            for _ in 0..count {
                bus.publish_discovery(DiscoveryResult::default());
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
    }

    #[tokio::test]
    async fn test_best_effort_waits_for_all_despite_failure() {
        let fixture = fixture(FailurePolicy::BestEffort);
        for name in ["api", "bad", "web"] {
            std::fs::create_dir_all(fixture.repo_root.path().join(name)).unwrap();
        }
        let config = config_with(vec![
            submodule("api", false),
            submodule("bad", true),
            submodule("web", false),
        ]);
        publish_results(&fixture.bus, 2);

        let outcomes = fixture
            .coordinator
            .run_discovery(
                &CancellationToken::new(),
                &payload(EventType::Push),
                &config,
                &HashMap::new(),
                Arc::new(Diff::new()),
                true,
                &run_context(&fixture),
            )
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.submodule.as_str())
            .collect();
        assert_eq!(failed, vec!["bad"]);
    }

    #[tokio::test]
    async fn test_fail_fast_still_joins_everyone() {
        let fixture = fixture(FailurePolicy::FailFast);
        for name in ["api", "bad"] {
            std::fs::create_dir_all(fixture.repo_root.path().join(name)).unwrap();
        }
        let config = config_with(vec![submodule("api", false), submodule("bad", true)]);
        publish_results(&fixture.bus, 1);

        let err = fixture
            .coordinator
            .run_discovery(
                &CancellationToken::new(),
                &payload(EventType::Push),
                &config,
                &HashMap::new(),
                Arc::new(Diff::new()),
                true,
                &run_context(&fixture),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("bad"));
        // The healthy sibling completed before the failure surfaced.
        assert_eq!(fixture.blocklist.fetched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_push_event_selects_post_merge_list() {
        let fixture = fixture(FailurePolicy::BestEffort);
        std::fs::create_dir_all(fixture.repo_root.path().join("post-only")).unwrap();

        let mut config = config_with(vec![submodule("post-only", false)]);
        config.pre_merge = MergeV2 {
            submodules: vec![submodule("pre-only", false)],
            env: HashMap::new(),
        };
        publish_results(&fixture.bus, 1);

        fixture
            .coordinator
            .run_discovery(
                &CancellationToken::new(),
                &payload(EventType::Push),
                &config,
                &HashMap::new(),
                Arc::new(Diff::new()),
                true,
                &run_context(&fixture),
            )
            .await
            .unwrap();

        let fetched = fixture.blocklist.fetched.lock().unwrap();
        assert_eq!(fetched.as_slice(), ["post-only"]);
    }

    #[tokio::test]
    async fn test_pull_request_selects_pre_merge_list() {
        let fixture = fixture(FailurePolicy::BestEffort);
        std::fs::create_dir_all(fixture.repo_root.path().join("pre-only")).unwrap();

        let mut config = config_with(vec![submodule("post-only", false)]);
        config.pre_merge = MergeV2 {
            submodules: vec![submodule("pre-only", false)],
            env: HashMap::new(),
        };
        publish_results(&fixture.bus, 1);

        fixture
            .coordinator
            .run_discovery(
                &CancellationToken::new(),
                &payload(EventType::PullRequest),
                &config,
                &HashMap::new(),
                Arc::new(Diff::new()),
                true,
                &run_context(&fixture),
            )
            .await
            .unwrap();

        let fetched = fixture.blocklist.fetched.lock().unwrap();
        assert_eq!(fetched.as_slice(), ["pre-only"]);
    }
}
