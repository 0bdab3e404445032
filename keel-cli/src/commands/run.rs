//! `keel run`: trigger an execution and follow it to the end

use anyhow::{Context, Result, anyhow};
use colored::*;
use keel_core::domain::execution::ExecutionStatus;
use keel_core::domain::source::SourceRef;
use keel_core::dto::notification::Notification;
use keel_engine::notify::{BroadcastNotifier, Published};
use keel_engine::{Config, Dispatcher, PipelineOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use uuid::Uuid;

use super::execution::{colorize_status, print_execution_details, print_log_line};
use crate::Settings;

/// How long the printer may take to drain after the run ends
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn handle_run(repo: &str, branch: &str, settings: &Settings) -> Result<()> {
    let config = Arc::new(load_config()?);
    info!(
        "Loaded configuration: target={:?}, workspace_base={}",
        config.target,
        config.workspace_base.display()
    );

    let store = crate::store::open(settings).await?;
    let notifier = BroadcastNotifier::default();
    let mut rx = notifier.subscribe();

    let orchestrator = PipelineOrchestrator::from_config(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::new(notifier),
    )
    .await
    .context("Failed to initialize the pipeline")?;

    let dispatcher = Dispatcher::start(Arc::new(orchestrator), Arc::clone(&store), &config);
    let execution = dispatcher.trigger(SourceRef::new(repo, branch)).await?;

    println!(
        "{} {}",
        "Started execution".bold(),
        execution.id.to_string().cyan()
    );
    println!("{}", "─".repeat(80).dimmed());

    let id = execution.id;
    let printer = tokio::spawn(async move { follow(&mut rx, id).await });

    dispatcher.shutdown().await;

    // The channel closes once the engine has dropped every sender.
    if tokio::time::timeout(DRAIN_TIMEOUT, printer).await.is_err() {
        warn!("Live log stream did not close; output may be incomplete");
    }
    println!("{}", "─".repeat(80).dimmed());

    let finished = store
        .get(id)
        .await?
        .ok_or_else(|| anyhow!("Execution {} disappeared from the store", id))?;
    print_execution_details(&finished);
    println!("\nResult: {}", colorize_status(finished.status));

    if finished.status == ExecutionStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Prints the log lines of one execution until the channel closes
async fn follow(rx: &mut broadcast::Receiver<Published>, id: Uuid) {
    loop {
        match rx.recv().await {
            Ok(published) => {
                if let Notification::Log(line) = published.notification {
                    if line.execution_id == id {
                        print_log_line(&line.line);
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                println!(
                    "{}",
                    format!("... {} log line(s) skipped; see `keel show {}`", skipped, id).dimmed()
                );
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            warn!("Failed to load config from environment ({:#}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
