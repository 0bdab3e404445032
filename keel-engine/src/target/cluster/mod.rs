//! Kubernetes deployment target
//!
//! Pushes images to the registry, then applies a Deployment and Service per
//! release and waits for the rollout. Rollback points the live objects at a
//! previous version.

pub mod manifests;
pub mod probe;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use keel_core::domain::execution::Execution;
use keel_core::domain::source::SourceRef;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use std::path::Path;
use std::sync::Arc;
use tokio::time::{Duration, Instant, sleep};
use tracing::{info, warn};

use crate::config::Config;
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::process::{ProcessRunner, shell_quote};
use crate::readiness::{self, ReadinessPolicy};
use crate::sink::LogSink;
use crate::target::{DeploymentTarget, ImageRef};

use self::manifests::Release;
use self::probe::ClusterProbe;

/// Field manager recorded on server-side applies
const FIELD_MANAGER: &str = "keel";

/// Poll interval while waiting for a deleted deployment to disappear
const DELETION_POLL: Duration = Duration::from_secs(2);

/// Deploys releases to a Kubernetes cluster
///
/// Holds one client for its whole lifetime; API handles are cheap clones.
pub struct ClusterDeployer {
    client: Client,
    config: Arc<Config>,
    runner: ProcessRunner,
}

impl ClusterDeployer {
    /// Connects using the configured kubeconfig, or the ambient configuration
    /// (in-cluster service account, `$KUBECONFIG`, `~/.kube/config`)
    pub async fn connect(config: Arc<Config>) -> Result<Self> {
        let client = build_client(&config.cluster.kubeconfig_path).await?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: Arc<Config>) -> Self {
        Self {
            client,
            config,
            runner: ProcessRunner::new(),
        }
    }

    /// Namespace for an application, created on first use
    ///
    /// Falls back to the default namespace when isolation is disabled or the
    /// namespace cannot be created.
    pub async fn resolve_namespace(&self, source: &SourceRef, sink: &dyn LogSink) -> String {
        let cluster = &self.config.cluster;
        if !cluster.per_app_namespace {
            return cluster.namespace.clone();
        }

        let name = namespace_name(&cluster.namespace_prefix, source);
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        let outcome = match namespaces.get_opt(&name).await {
            Ok(Some(_)) => Ok(false),
            Ok(None) => match namespaces
                .create(&PostParams::default(), &manifests::namespace(&name))
                .await
            {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(true) => {
                sink.line(&format!("Created namespace {}", name)).await;
                name
            }
            Ok(false) => name,
            Err(e) => {
                warn!("Failed to ensure namespace {}: {}", name, e);
                sink.line(&format!(
                    "Could not use namespace {} ({}); falling back to {}",
                    name, e, cluster.namespace
                ))
                .await;
                cluster.namespace.clone()
            }
        }
    }

    /// Replaces the deployment and applies the service
    ///
    /// A same-named deployment is deleted first, with a bounded wait for it
    /// to disappear, so selector changes never conflict.
    pub async fn apply(
        &self,
        namespace: &str,
        deployment: &Deployment,
        service: &Service,
        sink: &dyn LogSink,
    ) -> Result<()> {
        let name = deployment
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| PipelineError::Internal("deployment has no name".to_string()))?;
        let service_name = service
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| PipelineError::Internal("service has no name".to_string()))?;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.delete_and_wait(&deployments, name, sink).await?;

        let params = PatchParams::apply(FIELD_MANAGER).force();
        deployments
            .patch(name, &params, &Patch::Apply(deployment))
            .await?;
        sink.line(&format!("Applied deployment {}/{}", namespace, name))
            .await;

        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        services
            .patch(service_name, &params, &Patch::Apply(service))
            .await?;
        sink.line(&format!("Applied service {}/{}", namespace, service_name))
            .await;

        Ok(())
    }

    /// Polls the deployment until it is ready
    pub async fn wait_ready(&self, namespace: &str, name: &str, sink: &dyn LogSink) -> Result<()> {
        let probe = ClusterProbe::new(
            self.client.clone(),
            namespace,
            name,
            self.config.cluster.diagnostic_log_lines,
        );
        let policy = ReadinessPolicy::from(&self.config.deployment);
        readiness::wait_ready(&probe, &policy, sink).await
    }

    /// Points the live deployment and service at `previous_version`
    pub async fn rollback_to(
        &self,
        namespace: &str,
        name: &str,
        previous_version: &str,
        sink: &dyn LogSink,
    ) -> Result<String> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let mut live = deployments.get_opt(name).await?.ok_or_else(|| {
            PipelineError::ResourceMissing(format!("deployment {}/{}", namespace, name))
        })?;

        let image = manifests::retarget_deployment(&mut live, name, previous_version)?;
        sink.line(&format!("Rolling back {}/{} to {}", namespace, name, image))
            .await;

        // Selectors are immutable: recreate instead of patching.
        self.delete_and_wait(&deployments, name, sink).await?;
        deployments.create(&PostParams::default(), &live).await?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let selector = serde_json::json!({
            "spec": { "selector": manifests::selector(name, previous_version) }
        });
        match services
            .patch(name, &PatchParams::default(), &Patch::Merge(&selector))
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.code == 404 => {
                sink.line(&format!("Service {}/{} not found; selector left untouched", namespace, name))
                    .await;
            }
            Err(e) => return Err(e.into()),
        }

        self.wait_ready(namespace, name, sink).await?;
        Ok(image)
    }

    /// Logs in to the registry (when credentials are set) and pushes both tags
    pub async fn push_image(&self, image: &ImageRef, working_dir: &Path, sink: &dyn LogSink) -> Result<()> {
        let registry = &self.config.registry;

        if let Some((username, password)) = registry.credentials() {
            sink.line(&format!("Logging in to {}", registry.url)).await;
            let login = format!(
                "printf '%s' \"$KEEL_REGISTRY_PASSWORD\" | docker login --username {} --password-stdin {}",
                shell_quote(username),
                shell_quote(&registry.url)
            );
            self.runner
                .execute_with_env(
                    &login,
                    working_dir,
                    &[("KEEL_REGISTRY_PASSWORD", password)],
                    sink,
                    false,
                )
                .await?;
        }

        for tagged in [image.clone(), image.latest()] {
            sink.line(&format!("Pushing {}", tagged)).await;
            self.runner
                .execute(
                    &format!("docker push {}", shell_quote(&tagged.reference())),
                    working_dir,
                    sink,
                    self.config.build.quiet,
                )
                .await?;
        }
        Ok(())
    }

    /// Creates the image pull secret in `namespace` if it is missing
    ///
    /// Failures are logged; the deployment proceeds and fails later if the
    /// image really cannot be pulled.
    pub async fn ensure_registry_secret(&self, namespace: &str, sink: &dyn LogSink) {
        let registry = &self.config.registry;
        let Some((username, password)) = registry.credentials() else {
            return;
        };

        let name = &self.config.cluster.pull_secret_name;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let result = match secrets.get_opt(name).await {
            Ok(Some(_)) => return,
            Ok(None) => {
                let secret =
                    manifests::registry_secret(name, namespace, &registry.url, username, password);
                secrets.create(&PostParams::default(), &secret).await.map(|_| ())
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                sink.line(&format!("Created registry secret {}/{}", namespace, name))
                    .await
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {}
            Err(e) => {
                warn!("Failed to create registry secret in {}: {}", namespace, e);
                sink.line(&format!("Could not create registry secret: {}", e))
                    .await;
            }
        }
    }

    /// In-cluster URL of the service
    pub fn service_endpoint(&self, namespace: &str, service: &str) -> String {
        format!(
            "http://{}.{}.svc.cluster.local:{}",
            service, namespace, self.config.deployment.app_port
        )
    }

    async fn delete_and_wait(
        &self,
        deployments: &Api<Deployment>,
        name: &str,
        sink: &dyn LogSink,
    ) -> Result<()> {
        match deployments.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        sink.line(&format!("Deleting previous deployment {}", name)).await;
        let deadline = Instant::now() + self.config.cluster.deletion_timeout;
        while Instant::now() < deadline {
            if deployments.get_opt(name).await?.is_none() {
                return Ok(());
            }
            sleep(DELETION_POLL).await;
        }

        warn!("Deployment {} still present after deletion timeout", name);
        sink.line(&format!(
            "Deployment {} still terminating after {}s; continuing",
            name,
            self.config.cluster.deletion_timeout.as_secs()
        ))
        .await;
        Ok(())
    }
}

#[async_trait]
impl DeploymentTarget for ClusterDeployer {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn deliver(&self, ctx: &ExecutionContext, image: &ImageRef) -> Result<()> {
        self.push_image(image, ctx.workspace(), ctx).await
    }

    async fn deploy(&self, ctx: &ExecutionContext, image: &ImageRef) -> Result<String> {
        let app = ctx.source().dns_name();
        let namespace = self.resolve_namespace(ctx.source(), ctx).await;
        self.ensure_registry_secret(&namespace, ctx).await;

        let version = ctx.id().to_string();
        let release = Release {
            namespace: &namespace,
            app: &app,
            version: &version,
        };
        let (deployment, service) = manifests::build_manifests(&self.config, &release, image);

        info!("Deploying {} to namespace {}", image, namespace);
        self.apply(&namespace, &deployment, &service, ctx).await?;
        self.wait_ready(&namespace, &app, ctx).await?;

        Ok(self.service_endpoint(&namespace, &app))
    }

    async fn rollback(&self, ctx: &ExecutionContext, previous: &Execution) -> Result<ImageRef> {
        let app = ctx.source().dns_name();
        let namespace = self.resolve_namespace(ctx.source(), ctx).await;
        let version = previous.id.to_string();

        self.rollback_to(&namespace, &app, &version, ctx).await?;

        let repository = self.config.image_repository(&app);
        Ok(ImageRef::new(repository, version))
    }
}

/// Namespace name for an application: prefix plus DNS name, at most 63 chars
pub fn namespace_name(prefix: &str, source: &SourceRef) -> String {
    let mut name: String = format!("{}{}", prefix, source.dns_name())
        .chars()
        .take(63)
        .collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}

async fn build_client(kubeconfig_path: &Path) -> Result<Client> {
    if kubeconfig_path.is_file() {
        info!("Loading kubeconfig from {}", kubeconfig_path.display());
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .map_err(|e| PipelineError::Kubeconfig(e.to_string()))?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| PipelineError::Kubeconfig(e.to_string()))?;
        return Ok(Client::try_from(config)?);
    }

    info!(
        "Kubeconfig {} not found; using ambient cluster configuration",
        kubeconfig_path.display()
    );
    Ok(Client::try_default().await?)
}
