//! Test discovery dispatcher.
//!
//! Builds the runner invocation for one discovery target, runs it to
//! completion, then performs the single post-exit receive on the result
//! slot the log-observing collector fills while the subprocess runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use testflow_core::{AgentError, Diff, DiscoveryResult, SplitMode};

use crate::collaborators::IngestReporter;
use crate::context::RunContext;
use crate::exec::{merged_env, spawn_masked_pump};
use crate::rendezvous::{ResultCollector, POST_EXIT_DEADLINE};
use crate::selector::{discovery_args, SelectorInput};

/// Resolve the runner binary for a test framework.
pub fn framework_runner(framework: &str) -> Result<&'static str, AgentError> {
    match framework {
        "jest" => Ok("jest-runner"),
        "mocha" => Ok("mocha-runner"),
        "jasmine" => Ok("jasmine-runner"),
        other => Err(AgentError::failed(format!(
            "unsupported test framework `{other}`"
        ))),
    }
}

/// Everything one discovery invocation needs.
#[derive(Debug, Clone)]
pub struct DiscoverTarget {
    pub framework: String,
    pub patterns: Vec<String>,
    /// Module-level runner config, forwarded as `--config` when set.
    pub module_config_file: String,
    /// Active repo test-config file name; its presence in the diff forces
    /// full discovery.
    pub repo_config_file: String,
    pub smart_run: bool,
    pub working_dir: PathBuf,
    /// Merge-level env with any submodule overlay already applied.
    pub env_overlay: HashMap<String, String>,

    // Decorations for the reported result.
    pub parallelism: u32,
    pub split_mode: SplitMode,
    pub tier: String,
    pub container_image: String,
    pub submodule: Option<String>,
}

/// Dispatches discovery runner subprocesses and reports their results.
pub struct TestDiscovery {
    collector: Arc<dyn ResultCollector>,
    reporter: Arc<dyn IngestReporter>,
}

impl TestDiscovery {
    pub fn new(collector: Arc<dyn ResultCollector>, reporter: Arc<dyn IngestReporter>) -> Self {
        Self { collector, reporter }
    }

    /// Run one discovery to completion and report its decorated result.
    ///
    /// The receive on the result slot happens strictly after the
    /// subprocess has exited; the slot is fresh for this invocation.
    pub async fn discover(
        &self,
        cancel: &CancellationToken,
        target: &DiscoverTarget,
        secrets: &HashMap<String, String>,
        diff: &Diff,
        diff_exists: bool,
        run_context: &RunContext,
    ) -> Result<DiscoveryResult, AgentError> {
        let runner = framework_runner(&target.framework)?;
        let args = discovery_args(
            SelectorInput {
                diff,
                diff_exists,
                config_file_changed: diff.contains_key(&target.repo_config_file),
                smart_run: target.smart_run,
            },
            &target.patterns,
            &target.module_config_file,
        );

        // Fresh slot before the spawn: the collector observes the runner's
        // output while it runs and publishes into this slot.
        let slot = self.collector.discovery_slot();

        let env = merged_env(run_context, &target.env_overlay, secrets);

        info!(
            runner = runner,
            working_dir = %target.working_dir.display(),
            submodule = ?target.submodule,
            "executing test discovery command"
        );
        debug!(args = ?args, "discovery arguments");

        let mut cmd = Command::new(runner);
        cmd.args(&args)
            .current_dir(&target.working_dir)
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
                    warn!(error = %e, "failed to kill discovery runner on cancel");
                }
                return Err(AgentError::Aborted);
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            return Err(AgentError::internal(format!(
                "discovery runner exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }

        // The subprocess has fully exited; now, and only now, the single
        // receive on the slot.
        let mut result = slot.receive(POST_EXIT_DEADLINE).await?;

        result.parallelism = target.parallelism;
        result.split_mode = target.split_mode;
        result.tier = target.tier.clone();
        result.container_image = target.container_image.clone();
        result.submodule = target.submodule.clone();

        self.reporter.report_discovery(&result).await?;
        Ok(result)
    }
}
