//! Testflow Agent
//!
//! Runs one test task per process invocation inside an ephemeral CI
//! container and reports a single terminal status.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod cache;
mod collaborators;
mod config;
mod context;
mod discovery;
mod exec;
mod external;
mod lifecycle;
mod rendezvous;
mod report;
mod selector;
mod submodule;

use config::Config;
use discovery::TestDiscovery;
use exec::ProcessExecutor;
use external::{
    FileSecretProvider, HttpBlockTestService, HttpDiffProvider, HttpPayloadManager,
    RunnerExecutionService, ShallowGitManager, SidecarCacheStore, SidecarCoverageManager,
    YamlConfigManager,
};
use lifecycle::{Collaborators, Lifecycle};
use rendezvous::ResultBus;
use report::ReportClient;
use submodule::FailurePolicy;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Arc::new(Config::parse());
    info!(
        mode = ?config.mode,
        report_host = %config.report_host,
        "Starting Testflow agent"
    );

    let report = Arc::new(ReportClient::new(&config.report_host)?);
    let bus = Arc::new(ResultBus::new());
    let discovery = Arc::new(TestDiscovery::new(bus.clone(), report.clone()));

    let collab = Collaborators {
        payload_manager: Arc::new(HttpPayloadManager::new()?),
        git: Arc::new(ShallowGitManager::new(config.repo_root.clone())),
        cache: Arc::new(SidecarCacheStore::new(&config.sidecar_host)?),
        config_manager: Arc::new(YamlConfigManager::new(config.repo_root.clone())),
        exec: Arc::new(ProcessExecutor::new()),
        status_reporter: report.clone(),
        diff_provider: Arc::new(HttpDiffProvider::new(&config.report_host)?),
        secrets: Arc::new(FileSecretProvider),
        blocklist: Arc::new(HttpBlockTestService::new(
            &config.report_host,
            config.block_tests_file.clone(),
        )?),
        coverage: Arc::new(SidecarCoverageManager::new(&config.sidecar_host)?),
        execution: Arc::new(RunnerExecutionService::new(bus.clone(), report.clone())),
        discovery,
    };

    let lifecycle = Arc::new(Lifecycle::new(
        config,
        collab,
        FailurePolicy::BestEffort,
    ));

    // Interrupts abort the run; the lifecycle classifies and reports it.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, aborting run");
            signal_cancel.cancel();
        }
    });

    lifecycle.run(cancel).await?;
    Ok(())
}
