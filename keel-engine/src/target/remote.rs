//! Single-host deployment target
//!
//! Ships the image as a `docker save` archive over SSH and runs it with
//! docker compose when the project brings a compose file, or with a plain
//! `docker run` otherwise.

use async_trait::async_trait;
use keel_core::domain::execution::Execution;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::process::{ProcessRunner, shell_quote};
use crate::readiness::{self, ReadinessPolicy, ReadinessProbe, ReplicaCounts};
use crate::remote::RemoteShell;
use crate::sink::LogSink;
use crate::target::{DeploymentTarget, ImageRef};

pub const ARCHIVE_NAME: &str = "app.tar";
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Deploys to one host reachable over SSH
pub struct RemoteHostDeployer {
    shell: RemoteShell,
    runner: ProcessRunner,
    config: Arc<Config>,
}

impl RemoteHostDeployer {
    pub fn new(config: Arc<Config>) -> Self {
        let shell = RemoteShell::new(&config.remote);
        Self::with_shell(shell, config)
    }

    pub fn with_shell(shell: RemoteShell, config: Arc<Config>) -> Self {
        Self {
            shell,
            runner: ProcessRunner::new(),
            config,
        }
    }

    fn remote_path(&self, file: &str) -> String {
        format!("{}/{}", self.config.remote.remote_dir.trim_end_matches('/'), file)
    }

    fn container_name(&self, ctx: &ExecutionContext) -> String {
        self.config
            .remote
            .container_name
            .clone()
            .unwrap_or_else(|| ctx.source().dns_name())
    }

    async fn wait_ready(&self, image: &ImageRef, container: &str, sink: &dyn LogSink) -> Result<()> {
        if !self.config.deployment.health.enabled {
            return Ok(());
        }
        let probe = HostProbe {
            shell: &self.shell,
            image: image.clone(),
            container: container.to_string(),
            port: self.config.deployment.app_port,
            readiness_path: self.config.deployment.health.readiness_path.clone(),
            log_lines: self.config.cluster.diagnostic_log_lines,
        };
        let policy = ReadinessPolicy::from(&self.config.deployment);
        readiness::wait_ready(&probe, &policy, sink).await
    }
}

#[async_trait]
impl DeploymentTarget for RemoteHostDeployer {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn deliver(&self, ctx: &ExecutionContext, image: &ImageRef) -> Result<()> {
        let workspace = ctx.workspace();
        let archive = workspace.join(ARCHIVE_NAME);

        ctx.log(&format!("Saving {} to {}", image, ARCHIVE_NAME)).await;
        let save = format!(
            "docker save -o {} {} {}",
            shell_quote(&archive.display().to_string()),
            shell_quote(&image.reference()),
            shell_quote(&image.latest().reference())
        );
        self.runner
            .execute(&save, workspace, ctx, self.config.build.quiet)
            .await?;

        let destination = self.shell.destination();
        ctx.log(&format!("Transferring {} to {}", ARCHIVE_NAME, destination))
            .await;
        self.shell
            .transfer(&archive, &self.remote_path(ARCHIVE_NAME))
            .await?;

        let compose = workspace.join(COMPOSE_FILE);
        if compose.is_file() {
            ctx.log(&format!("Transferring {} to {}", COMPOSE_FILE, destination))
                .await;
            self.shell
                .transfer(&compose, &self.remote_path(COMPOSE_FILE))
                .await?;
        } else {
            ctx.log(&format!(
                "WARNING: no {} in the project; the container will be started with docker run",
                COMPOSE_FILE
            ))
            .await;
        }

        Ok(())
    }

    async fn deploy(&self, ctx: &ExecutionContext, image: &ImageRef) -> Result<String> {
        let container = self.container_name(ctx);
        let with_compose = ctx.workspace().join(COMPOSE_FILE).is_file();
        let command = deploy_command(
            &self.config.remote.remote_dir,
            with_compose,
            &container,
            image,
            self.config.deployment.app_port,
        );

        info!("Deploying {} on {}", image, self.shell.destination());
        self.shell.execute_remote(&command, ctx).await?;
        self.wait_ready(image, &container, ctx).await?;

        Ok(format!(
            "http://{}:{}",
            self.config.remote.host, self.config.deployment.app_port
        ))
    }

    async fn rollback(&self, ctx: &ExecutionContext, previous: &Execution) -> Result<ImageRef> {
        let container = self.container_name(ctx);
        let repository = self.config.image_repository(&ctx.source().dns_name());
        let image = ImageRef::new(repository, previous.id.to_string());

        ctx.log(&format!("Restarting {} on {}", image, self.shell.destination()))
            .await;
        let command = rollback_command(
            &self.config.remote.remote_dir,
            &container,
            &image,
            self.config.deployment.app_port,
        );
        self.shell.execute_remote(&command, ctx).await?;
        self.wait_ready(&image, &container, ctx).await?;

        Ok(image)
    }
}

/// Loads the shipped archive and (re)starts the application
pub fn deploy_command(
    remote_dir: &str,
    with_compose: bool,
    container: &str,
    image: &ImageRef,
    port: i32,
) -> String {
    let dir = shell_quote(remote_dir);
    let load = format!("docker load -i {}/{}", dir, ARCHIVE_NAME);

    if with_compose {
        format!(
            "cd {} && {} && (docker compose down || true) && docker compose up -d",
            dir, load
        )
    } else {
        format!("{} && {}", load, run_command(container, image, port))
    }
}

/// Restarts the application from an image already present on the host
///
/// With a compose file the image is retagged as `latest` so compose picks
/// it up; otherwise the container is replaced.
pub fn rollback_command(remote_dir: &str, container: &str, image: &ImageRef, port: i32) -> String {
    let dir = shell_quote(remote_dir);
    format!(
        "if [ -f {dir}/{compose} ]; then docker tag {image} {latest} && cd {dir} && (docker compose down || true) && docker compose up -d; else {run}; fi",
        dir = dir,
        compose = COMPOSE_FILE,
        image = shell_quote(&image.reference()),
        latest = shell_quote(&image.latest().reference()),
        run = run_command(container, image, port),
    )
}

fn run_command(container: &str, image: &ImageRef, port: i32) -> String {
    let name = shell_quote(container);
    format!(
        "(docker stop {name} || true) && (docker rm {name} || true) && docker run -d --name {name} --restart unless-stopped -p {port}:{port} {image}",
        name = name,
        port = port,
        image = shell_quote(&image.reference()),
    )
}

/// Readiness of the application on the host, checked with curl over SSH
struct HostProbe<'a> {
    shell: &'a RemoteShell,
    image: ImageRef,
    container: String,
    port: i32,
    readiness_path: String,
    log_lines: i64,
}

impl HostProbe<'_> {
    fn health_command(&self) -> String {
        format!(
            "curl -fsS -o /dev/null {}",
            shell_quote(&format!("http://localhost:{}{}", self.port, self.readiness_path))
        )
    }

    fn ancestor_filter(&self) -> String {
        shell_quote(&format!("ancestor={}", self.image.reference()))
    }
}

#[async_trait]
impl ReadinessProbe for HostProbe<'_> {
    fn target(&self) -> String {
        format!("{} on {}", self.container, self.shell.destination())
    }

    async fn replica_counts(&self) -> Result<ReplicaCounts> {
        match self.shell.execute_remote_capture(&self.health_command()).await {
            Ok(_) => Ok(ReplicaCounts::new(1, 1)),
            Err(PipelineError::RemoteExec { .. }) => Ok(ReplicaCounts::new(1, 0)),
            Err(e) => Err(e),
        }
    }

    async fn progress(&self) -> Vec<String> {
        let command = format!(
            "docker ps -a --filter {} --format '{{{{.Names}}}} {{{{.Status}}}}'",
            self.ancestor_filter()
        );
        match self.shell.execute_remote_capture(&command).await {
            Ok(lines) => lines.into_iter().map(|l| format!("Container {}", l)).collect(),
            Err(e) => vec![format!("Failed to list containers: {}", e)],
        }
    }

    async fn diagnostics(&self) -> Vec<String> {
        let mut lines = self.progress().await;
        let command = format!(
            "for c in $(docker ps -aq --filter {}); do echo \"--- $c ---\"; docker logs --tail {} \"$c\" 2>&1; done",
            self.ancestor_filter(),
            self.log_lines
        );
        match self.shell.execute_remote_capture(&command).await {
            Ok(logs) => lines.extend(logs),
            Err(e) => lines.push(format!("Failed to fetch container logs: {}", e)),
        }
        lines
    }
}
