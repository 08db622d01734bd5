//! Subprocess plumbing: secret masking, environment assembly, and the
//! shell-command execution manager.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use testflow_core::{AgentError, CommandBlock};

use crate::collaborators::{CommandKind, ExecutionManager};
use crate::context::RunContext;

const MASK: &str = "*****";

/// Replace every secret value occurring in `line` with a mask.
pub fn mask_secrets(line: &str, secrets: &HashMap<String, String>) -> String {
    let mut masked = line.to_string();
    for value in secrets.values() {
        if !value.is_empty() {
            masked = masked.replace(value, MASK);
        }
    }
    masked
}

/// Interpolate `${NAME}` references in an env value from the secret map.
fn interpolate(value: &str, secrets: &HashMap<String, String>) -> String {
    let mut out = value.to_string();
    for (name, secret) in secrets {
        out = out.replace(&format!("${{{name}}}"), secret);
    }
    out
}

/// Assemble the full child environment: run-context variables first, then
/// the call-level overlay (secret references interpolated). Later entries
/// win on collision, so an overlay may shadow a context variable.
pub fn merged_env(
    run_context: &RunContext,
    overlay: &HashMap<String, String>,
    secrets: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut env = run_context.env_vars();
    let mut keys: Vec<&String> = overlay.keys().collect();
    keys.sort();
    for key in keys {
        env.push((key.clone(), interpolate(&overlay[key], secrets)));
    }
    env
}

/// Pump a child stream line-by-line into the log sink, masking secrets.
pub fn spawn_masked_pump<R>(
    reader: R,
    secrets: HashMap<String, String>,
    stream: &'static str,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        info!(stream = stream, "{}", mask_secrets(trimmed, &secrets));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, stream = stream, "error reading subprocess output");
                    break;
                }
            }
        }
    })
}

/// Run one shell command to completion under the cancellation token,
/// output masked into the log sink. Kills the child on cancel.
pub async fn run_shell_command(
    cancel: &CancellationToken,
    command: &str,
    cwd: &Path,
    env: &[(String, String)],
    secrets: &HashMap<String, String>,
) -> Result<(), AgentError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    if let Some(stdout) = stdout {
        spawn_masked_pump(stdout, secrets.clone(), "stdout");
    }
    if let Some(stderr) = stderr {
        spawn_masked_pump(stderr, secrets.clone(), "stderr");
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill subprocess on cancel");
            }
            return Err(AgentError::Aborted);
        }
        status = child.wait() => status?,
    };

    if !status.success() {
        return Err(AgentError::internal(format!(
            "command exited with status {}",
            status.code().unwrap_or(-1)
        )));
    }
    Ok(())
}

/// [`ExecutionManager`] backed by `sh -c` subprocesses.
#[derive(Debug, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionManager for ProcessExecutor {
    async fn execute_user_commands(
        &self,
        cancel: &CancellationToken,
        kind: CommandKind,
        block: &CommandBlock,
        secrets: &HashMap<String, String>,
        cwd: &Path,
        run_context: &RunContext,
    ) -> Result<(), AgentError> {
        let env = merged_env(run_context, &block.env, secrets);
        for command in &block.commands {
            info!(kind = kind.as_str(), command = %mask_secrets(command, secrets), "running user command");
            run_shell_command(cancel, command, cwd, &env, secrets).await?;
        }
        Ok(())
    }

    async fn execute_internal_commands(
        &self,
        cancel: &CancellationToken,
        kind: CommandKind,
        commands: &[String],
        cwd: &Path,
        run_context: &RunContext,
    ) -> Result<(), AgentError> {
        let env = run_context.env_vars();
        let secrets = HashMap::new();
        for command in commands {
            info!(kind = kind.as_str(), command = %command, "running internal command");
            run_shell_command(cancel, command, cwd, &env, &secrets).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use testflow_core::{BuildPayload, EventType, GitProvider};

    use crate::config::Config;

    fn secrets() -> HashMap<String, String> {
        [
            ("NPM_TOKEN".to_string(), "tok-12345".to_string()),
            ("API_KEY".to_string(), "key-67890".to_string()),
        ]
        .into_iter()
        .collect()
    }

    fn run_context() -> RunContext {
        let config = Config::parse_from(["testflow-agent"]);
        let payload = BuildPayload {
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
        };
        RunContext::new(&config, &payload, Path::new("/tmp/cov"))
    }

    #[test]
    fn test_mask_replaces_every_occurrence() {
        let masked = mask_secrets("token tok-12345 again tok-12345", &secrets());
        assert!(!masked.contains("tok-12345"));
        assert_eq!(masked, "token ***** again *****");
    }

    #[test]
    fn test_mask_leaves_clean_lines_alone() {
        let line = "installing dependencies";
        assert_eq!(mask_secrets(line, &secrets()), line);
    }

    #[test]
    fn test_env_overlay_interpolates_secrets() {
        let overlay: HashMap<String, String> =
            [("NODE_AUTH_TOKEN".to_string(), "${NPM_TOKEN}".to_string())]
                .into_iter()
                .collect();
        let env = merged_env(&run_context(), &overlay, &secrets());
        let value = env
            .iter()
            .find(|(k, _)| k == "NODE_AUTH_TOKEN")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(value, "tok-12345");
    }

    #[test]
    fn test_env_overlay_shadows_context() {
        let overlay: HashMap<String, String> =
            [("ENV".to_string(), "override".to_string())].into_iter().collect();
        let env = merged_env(&run_context(), &overlay, &secrets());
        let last = env.iter().rev().find(|(k, _)| k == "ENV").unwrap();
        assert_eq!(last.1, "override");
    }

    #[tokio::test]
    async fn test_run_command_success() {
        let cancel = CancellationToken::new();
        let result = run_shell_command(
            &cancel,
            "true",
            Path::new("."),
            &[],
            &HashMap::new(),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_command_nonzero_exit() {
        let cancel = CancellationToken::new();
        let err = run_shell_command(
            &cancel,
            "exit 3",
            Path::new("."),
            &[],
            &HashMap::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("status 3"));
    }

    #[tokio::test]
    async fn test_cancel_kills_command() {
        let cancel = CancellationToken::new();
        let killer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            killer.cancel();
        });

        let started = std::time::Instant::now();
        let err = run_shell_command(
            &cancel,
            "sleep 10",
            Path::new("."),
            &[],
            &HashMap::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::Aborted));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_user_commands_stop_on_first_failure() {
        let cancel = CancellationToken::new();
        let executor = ProcessExecutor::new();
        let block = CommandBlock {
            commands: vec!["false".to_string(), "true".to_string()],
            env: HashMap::new(),
        };
        let result = executor
            .execute_user_commands(
                &cancel,
                CommandKind::PreRun,
                &block,
                &HashMap::new(),
                Path::new("."),
                &run_context(),
            )
            .await;
        assert!(result.is_err());
    }
}
