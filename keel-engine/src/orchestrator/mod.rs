//! Pipeline orchestrator
//!
//! Drives one execution through the stage sequence:
//!
//! 1. FETCH: clone the branch into a private workspace
//! 2. BUILD: run the build command
//! 3. QUALITY: optional analysis command, then the quality gate
//! 4. CONTAINERIZE: build the image tagged with the execution id and `latest`
//! 5. DELIVER: hand the image to the deployment target
//! 6. DEPLOY: run it and wait for readiness
//! 7. VERIFY: optional security scan against the deployed endpoint
//!
//! Any stage error ends the run as FAILED and triggers a rollback to the
//! latest successful execution of the same repository. The outcome is only
//! reported through the store and the notifier.

use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use keel_core::domain::execution::ExecutionStatus;

use crate::config::{Config, TargetKind};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::notify::Notifier;
use crate::process::{ProcessRunner, shell_quote};
use crate::quality::{QualityGate, SonarQualityGate};
use crate::source::{GitSourceFetcher, SourceFetcher};
use crate::store::ExecutionStore;
use crate::target::{ClusterDeployer, DeploymentTarget, ImageRef, RemoteHostDeployer};

#[cfg(test)]
mod tests;

/// Runs pipeline executions end to end
pub struct PipelineOrchestrator {
    config: Arc<Config>,
    store: Arc<dyn ExecutionStore>,
    notifier: Arc<dyn Notifier>,
    fetcher: Arc<dyn SourceFetcher>,
    quality_gate: Option<Arc<dyn QualityGate>>,
    target: Arc<dyn DeploymentTarget>,
    runner: ProcessRunner,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ExecutionStore>,
        notifier: Arc<dyn Notifier>,
        fetcher: Arc<dyn SourceFetcher>,
        target: Arc<dyn DeploymentTarget>,
    ) -> Self {
        Self {
            config,
            store,
            notifier,
            fetcher,
            quality_gate: None,
            target,
            runner: ProcessRunner::new(),
        }
    }

    pub fn with_quality_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.quality_gate = Some(gate);
        self
    }

    /// Wires the production collaborators for the configured target
    pub async fn from_config(
        config: Arc<Config>,
        store: Arc<dyn ExecutionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let target: Arc<dyn DeploymentTarget> = match config.target {
            TargetKind::Cluster => Arc::new(ClusterDeployer::connect(Arc::clone(&config)).await?),
            TargetKind::Remote => Arc::new(RemoteHostDeployer::new(Arc::clone(&config))),
        };
        info!("Deployment target: {}", target.name());

        let quality_enabled = config.quality.enabled;
        let mut orchestrator = Self::new(
            Arc::clone(&config),
            store,
            notifier,
            Arc::new(GitSourceFetcher::new()),
            target,
        );
        if quality_enabled {
            orchestrator = orchestrator.with_quality_gate(Arc::new(SonarQualityGate::new(&config.quality)));
        }
        Ok(orchestrator)
    }

    /// Drives a PENDING execution to SUCCESS or FAILED
    ///
    /// Never fails: every error ends up in the execution log and status.
    /// End time, final persistence, workspace cleanup and the final state
    /// notification happen on every path, stage panics included.
    pub async fn run(self: &Arc<Self>, execution_id: Uuid) {
        let execution = match self.store.get(execution_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                error!("Execution {} not found", execution_id);
                return;
            }
            Err(e) => {
                error!("Failed to load execution {}: {:#}", execution_id, e);
                return;
            }
        };

        let ctx = ExecutionContext::new(
            execution,
            &self.config.workspace_base,
            Arc::clone(&self.store),
            Arc::clone(&self.notifier),
        );

        if let Err(e) = ctx.start().await {
            warn!("Refusing to run execution {}: {}", execution_id, e);
            return;
        }

        info!("Starting execution {} for {}", execution_id, ctx.source());
        ctx.log(&format!(
            "Pipeline started for {} (branch {})",
            ctx.source().repo_url,
            ctx.source().branch
        ))
        .await;
        persist(&ctx).await;
        ctx.publish_state().await;

        let flusher = ctx.spawn_flusher(self.config.log_flush_interval);

        let stages = {
            let this = Arc::clone(self);
            let ctx = Arc::clone(&ctx);
            guarded(async move { this.run_stages(&ctx).await }).await
        };

        match stages {
            Ok(()) => {
                if let Err(e) = ctx.finish(ExecutionStatus::Success).await {
                    error!("{}", e);
                }
                ctx.log("Pipeline completed successfully").await;
                info!("Execution {} succeeded", execution_id);
            }
            Err(e) => self.handle_failure(&ctx, e).await,
        }

        flusher.abort();
        self.finalize(&ctx).await;
    }

    async fn run_stages(&self, ctx: &ExecutionContext) -> Result<()> {
        let source = ctx.source();
        let workspace = ctx.workspace();
        let build = &self.config.build;

        stage(ctx, 1, "FETCH").await;
        tokio::fs::create_dir_all(&self.config.workspace_base).await?;
        self.fetcher
            .fetch(&source.repo_url, &source.branch, workspace)
            .await?;
        ctx.log(&format!("Checked out {} into {}", source, workspace.display()))
            .await;

        stage(ctx, 2, "BUILD").await;
        self.runner
            .execute(&build.command, workspace, ctx, build.quiet)
            .await?;

        stage(ctx, 3, "QUALITY").await;
        if let Some(analysis) = &build.analysis_command {
            self.runner
                .execute(analysis, workspace, ctx, build.quiet)
                .await?;
        }
        match &self.quality_gate {
            Some(gate) => {
                let project_key = source.app_name();
                ctx.log(&format!("Checking quality gate for {}", project_key))
                    .await;
                gate.verify(&project_key).await?;
                ctx.log("Quality gate passed").await;
            }
            None => ctx.log("Quality gate disabled; skipping").await,
        }

        stage(ctx, 4, "CONTAINERIZE").await;
        let image = ImageRef::new(
            self.config.image_repository(&source.dns_name()),
            ctx.id().to_string(),
        );
        let command = build
            .image_command
            .replace("{image}", &shell_quote(&image.reference()))
            .replace("{latest}", &shell_quote(&image.latest().reference()));
        self.runner
            .execute(&command, workspace, ctx, build.quiet)
            .await?;
        ctx.log(&format!("Built image {}", image)).await;

        stage(ctx, 5, "DELIVER").await;
        self.target.deliver(ctx, &image).await?;

        stage(ctx, 6, "DEPLOY").await;
        let endpoint = self.target.deploy(ctx, &image).await?;
        ctx.log(&format!("Deployed {} at {}", image, endpoint)).await;

        if let Some(scan) = &self.config.scan {
            stage(ctx, 7, "VERIFY").await;
            ctx.log(&format!(
                "Waiting {}s before scanning {}",
                scan.delay.as_secs(),
                endpoint
            ))
            .await;
            tokio::time::sleep(scan.delay).await;
            let command = scan.command.replace("{url}", &shell_quote(&endpoint));
            self.runner
                .execute(&command, workspace, ctx, false)
                .await?;
            ctx.log("Security scan passed").await;
        }

        Ok(())
    }

    /// Marks the run FAILED and puts the last good version back
    ///
    /// Rollback problems are logged; they never change the outcome. The end
    /// time is left open until [`Self::finalize`] so it covers the rollback.
    async fn handle_failure(self: &Arc<Self>, ctx: &Arc<ExecutionContext>, err: PipelineError) {
        error!("Execution {} failed: {}", ctx.id(), err);
        ctx.log(&format!("ERROR: {}", err)).await;
        if let Err(e) = ctx.finish(ExecutionStatus::Failed).await {
            error!("{}", e);
        }
        persist(ctx).await;
        ctx.publish_state().await;

        ctx.log("--- ATTEMPTING ROLLBACK ---").await;
        let previous = match self.store.find_latest_success(ctx.source()).await {
            Ok(Some(previous)) => previous,
            Ok(None) => {
                ctx.log("No stable version found; rollback skipped").await;
                return;
            }
            Err(e) => {
                ctx.log(&format!("Rollback failed: could not look up the last stable version: {:#}", e))
                    .await;
                return;
            }
        };

        ctx.log(&format!("Rolling back to version {}", previous.id))
            .await;
        let rollback = {
            let target = Arc::clone(&self.target);
            let ctx = Arc::clone(ctx);
            let previous = previous.clone();
            guarded(async move { target.rollback(&ctx, &previous).await }).await
        };

        match rollback {
            Ok(image) => {
                info!("Execution {} rolled back to {}", ctx.id(), image);
                ctx.log(&format!("Rollback succeeded to version {}", previous.id))
                    .await;
            }
            Err(e) => {
                warn!("Rollback of execution {} failed: {}", ctx.id(), e);
                ctx.log(&format!("Rollback failed: {}", e)).await;
            }
        }
    }

    async fn finalize(&self, ctx: &ExecutionContext) {
        if let Err(e) = ctx.close().await {
            error!("{}", e);
        }

        match tokio::fs::remove_dir_all(ctx.workspace()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove workspace {}: {}", ctx.workspace().display(), e);
                ctx.log(&format!("WARNING: failed to clean up workspace: {}", e))
                    .await;
            }
        }

        let status = ctx.status().await;
        ctx.log(&format!("Pipeline finished with status {}", status))
            .await;
        persist(ctx).await;
        ctx.publish_state().await;
        info!("Execution {} finished with status {}", ctx.id(), status);
    }
}

/// Logs the stage banner and publishes a snapshot
async fn stage(ctx: &ExecutionContext, number: u8, name: &str) {
    ctx.log(&format!("--- STAGE {}: {} ---", number, name)).await;
    persist(ctx).await;
    ctx.publish_state().await;
}

async fn persist(ctx: &ExecutionContext) {
    if let Err(e) = ctx.persist().await {
        error!("Failed to persist execution {}: {:#}", ctx.id(), e);
    }
}

/// Runs `fut` on its own task so a panic surfaces as an error
async fn guarded<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(PipelineError::Internal(format!("stage panicked: {}", e))),
        Err(e) => Err(PipelineError::Internal(format!("stage task failed: {}", e))),
    }
}
