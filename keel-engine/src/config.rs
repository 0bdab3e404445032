//! Engine configuration
//!
//! Defines every tunable of a pipeline run: the build command, the registry,
//! the deployment target and its readiness policy, the quality gate and the
//! optional security scan.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Where built images are deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Cluster,
    Remote,
}

impl std::str::FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cluster" | "k8s" | "kubernetes" => Ok(TargetKind::Cluster),
            "remote" | "vm" | "ssh" => Ok(TargetKind::Remote),
            other => Err(format!("unknown deployment target: {}", other)),
        }
    }
}

/// Engine configuration
///
/// Every interval and timeout is configurable so slow clusters and quick
/// local setups can share the same binary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for per-execution workspaces
    pub workspace_base: PathBuf,

    /// Deployment backend used by every run
    pub target: TargetKind,

    /// How often in-flight logs are persisted to the store
    pub log_flush_interval: Duration,

    /// Max executions running at the same time
    pub max_parallel_runs: usize,

    /// Serialize runs that share a repository URL
    pub serialize_per_source: bool,

    pub build: BuildConfig,
    pub registry: RegistryConfig,
    pub deployment: DeploymentConfig,
    pub cluster: ClusterConfig,
    pub remote: RemoteConfig,
    pub quality: QualityConfig,

    /// Post-deploy scan; the verify stage is skipped when unset
    pub scan: Option<ScanConfig>,
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Shell command that builds the checked-out project
    pub command: String,

    /// Only forward lines that look like build verdicts or errors
    pub quiet: bool,

    /// Image build command; `{image}` and `{latest}` are replaced by the
    /// two tags of the execution
    pub image_command: String,

    /// Prepended to the app name to form the image repository
    /// (e.g. "registry.example.com/team")
    pub image_prefix: String,

    /// Static analysis command run before the quality gate is queried
    pub analysis_command: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RegistryConfig {
    /// Username and password, when both are configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    pub app_port: i32,

    /// How long to wait for the deployment to become ready
    pub timeout: Duration,

    /// Delay between readiness checks
    pub poll_interval: Duration,

    /// One extra wait granted after the timeout expires
    pub final_wait: Duration,

    pub health: HealthCheckConfig,
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub liveness_path: String,
    pub readiness_path: String,
    pub liveness: ProbeTiming,
    pub readiness: ProbeTiming,
}

/// Probe timings, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTiming {
    pub initial_delay: i32,
    pub period: i32,
    pub timeout: i32,
    pub failure_threshold: i32,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Kubeconfig file; the ambient configuration is used when it is missing
    pub kubeconfig_path: PathBuf,

    pub namespace: String,

    /// Deploy each application into its own namespace
    pub per_app_namespace: bool,

    pub namespace_prefix: String,
    pub default_cpu: String,
    pub default_memory: String,
    pub service_type: String,

    /// Extra containers deployed next to the application
    pub sidecars: Vec<SidecarSpec>,

    pub pull_secret_name: String,

    /// Pod log lines collected when a deployment fails
    pub diagnostic_log_lines: i64,

    /// Max wait for a replaced deployment to disappear
    pub deletion_timeout: Duration,
}

/// Sidecar container declaration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SidecarSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub port: Option<i32>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub private_key_path: PathBuf,
    pub remote_dir: String,

    /// Verify host keys against known_hosts
    pub strict_host_key_checking: bool,

    /// Container name used when no compose file ships with the project
    pub container_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub enabled: bool,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Scan command; `{url}` is replaced by the deployed endpoint
    pub command: String,

    /// Wait before scanning so the service can settle
    pub delay: Duration,
}

impl Config {
    /// Creates a configuration with defaults for the given target
    pub fn new(target: TargetKind) -> Self {
        Self {
            workspace_base: PathBuf::from("temp-workspace"),
            target,
            log_flush_interval: Duration::from_secs(5),
            max_parallel_runs: 4,
            serialize_per_source: true,
            build: BuildConfig {
                command: "chmod +x mvnw && ./mvnw clean package".to_string(),
                quiet: false,
                image_command: "docker build -t {image} -t {latest} .".to_string(),
                image_prefix: String::new(),
                analysis_command: None,
            },
            registry: RegistryConfig {
                url: "docker.io".to_string(),
                username: None,
                password: None,
            },
            deployment: DeploymentConfig {
                app_port: 8080,
                timeout: Duration::from_secs(15 * 60),
                poll_interval: Duration::from_secs(10),
                final_wait: Duration::from_secs(60),
                health: HealthCheckConfig {
                    enabled: true,
                    liveness_path: "/actuator/health".to_string(),
                    readiness_path: "/actuator/health/readiness".to_string(),
                    liveness: ProbeTiming {
                        initial_delay: 60,
                        period: 10,
                        timeout: 5,
                        failure_threshold: 5,
                    },
                    readiness: ProbeTiming {
                        initial_delay: 30,
                        period: 5,
                        timeout: 3,
                        failure_threshold: 5,
                    },
                },
            },
            cluster: ClusterConfig {
                kubeconfig_path: PathBuf::from("/root/.kube/config"),
                namespace: "default".to_string(),
                per_app_namespace: true,
                namespace_prefix: "keel-".to_string(),
                default_cpu: "250m".to_string(),
                default_memory: "256Mi".to_string(),
                service_type: "ClusterIP".to_string(),
                sidecars: Vec::new(),
                pull_secret_name: "registry-secret".to_string(),
                diagnostic_log_lines: 20,
                deletion_timeout: Duration::from_secs(60),
            },
            remote: RemoteConfig {
                host: String::new(),
                user: "deploy".to_string(),
                port: 22,
                private_key_path: PathBuf::from("/root/.ssh/id_rsa"),
                remote_dir: "/home/deploy".to_string(),
                strict_host_key_checking: false,
                container_name: None,
            },
            quality: QualityConfig {
                enabled: true,
                url: "http://localhost:9000".to_string(),
                username: None,
                password: None,
            },
            scan: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Unset or unparsable variables keep their defaults. The most common:
    /// - KEEL_TARGET (cluster | remote, default: cluster)
    /// - KEEL_WORKSPACE_BASE (default: temp-workspace)
    /// - KEEL_BUILD_COMMAND, KEEL_BUILD_QUIET, KEEL_IMAGE_PREFIX
    /// - REGISTRY_URL, REGISTRY_USERNAME, REGISTRY_PASSWORD
    /// - KUBECONFIG_PATH, K8S_NAMESPACE, KEEL_SIDECARS (JSON array)
    /// - VM_HOST, VM_USER, VM_PORT, VM_PRIVATE_KEY_PATH
    /// - SONAR_URL, SONAR_USERNAME, SONAR_PASSWORD
    /// - KEEL_SCAN_COMMAND, KEEL_SCAN_DELAY (seconds, default: 15)
    pub fn from_env() -> anyhow::Result<Self> {
        let target = match std::env::var("KEEL_TARGET") {
            Ok(value) => value.parse::<TargetKind>().map_err(anyhow::Error::msg)?,
            Err(_) => TargetKind::Cluster,
        };

        let mut config = Self::new(target);

        if let Some(base) = env_string("KEEL_WORKSPACE_BASE") {
            config.workspace_base = PathBuf::from(base);
        }
        config.log_flush_interval = env_secs("KEEL_LOG_FLUSH_INTERVAL", config.log_flush_interval);
        config.max_parallel_runs = env_parse("KEEL_MAX_PARALLEL_RUNS", config.max_parallel_runs);
        config.serialize_per_source =
            env_parse("KEEL_SERIALIZE_PER_SOURCE", config.serialize_per_source);

        let build = &mut config.build;
        if let Some(command) = env_string("KEEL_BUILD_COMMAND") {
            build.command = command;
        }
        build.quiet = env_parse("KEEL_BUILD_QUIET", build.quiet);
        if let Some(command) = env_string("KEEL_IMAGE_BUILD_COMMAND") {
            build.image_command = command;
        }
        if let Some(prefix) = env_string("KEEL_IMAGE_PREFIX") {
            build.image_prefix = prefix;
        }
        build.analysis_command = env_string("KEEL_ANALYSIS_COMMAND");

        let registry = &mut config.registry;
        if let Some(url) = env_string("REGISTRY_URL") {
            registry.url = url;
        }
        registry.username = env_string("REGISTRY_USERNAME");
        registry.password = env_string("REGISTRY_PASSWORD");

        let deployment = &mut config.deployment;
        deployment.app_port = env_parse("KEEL_APP_PORT", deployment.app_port);
        deployment.timeout = std::env::var("KEEL_DEPLOYMENT_TIMEOUT_MINUTES")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|minutes| Duration::from_secs(minutes * 60))
            .unwrap_or(deployment.timeout);
        deployment.poll_interval =
            env_secs("KEEL_READINESS_POLL_INTERVAL", deployment.poll_interval);
        deployment.final_wait = env_secs("KEEL_READINESS_FINAL_WAIT", deployment.final_wait);
        deployment.health.enabled = env_parse("KEEL_HEALTHCHECK_ENABLED", deployment.health.enabled);
        if let Some(path) = env_string("KEEL_HEALTHCHECK_PATH") {
            deployment.health.liveness_path = path;
        }
        if let Some(path) = env_string("KEEL_READINESS_PATH") {
            deployment.health.readiness_path = path;
        }

        let cluster = &mut config.cluster;
        if let Some(path) = env_string("KUBECONFIG_PATH") {
            cluster.kubeconfig_path = PathBuf::from(path);
        }
        if let Some(namespace) = env_string("K8S_NAMESPACE") {
            cluster.namespace = namespace;
        }
        cluster.per_app_namespace = env_parse("KEEL_PER_APP_NAMESPACE", cluster.per_app_namespace);
        if let Some(cpu) = env_string("KEEL_DEFAULT_CPU") {
            cluster.default_cpu = cpu;
        }
        if let Some(memory) = env_string("KEEL_DEFAULT_MEMORY") {
            cluster.default_memory = memory;
        }
        if let Some(service_type) = env_string("KEEL_SERVICE_TYPE") {
            cluster.service_type = service_type;
        }
        if let Some(raw) = env_string("KEEL_SIDECARS") {
            cluster.sidecars = parse_sidecars(&raw)?;
        }

        let remote = &mut config.remote;
        if let Some(host) = env_string("VM_HOST") {
            remote.host = host;
        }
        if let Some(user) = env_string("VM_USER") {
            remote.user = user;
        }
        remote.port = env_parse("VM_PORT", remote.port);
        if let Some(key) = env_string("VM_PRIVATE_KEY_PATH") {
            remote.private_key_path = PathBuf::from(key);
        }
        remote.remote_dir =
            env_string("VM_REMOTE_DIR").unwrap_or_else(|| format!("/home/{}", remote.user));
        remote.strict_host_key_checking = env_parse(
            "VM_STRICT_HOST_KEY_CHECKING",
            remote.strict_host_key_checking,
        );
        remote.container_name = env_string("VM_CONTAINER_NAME");

        let quality = &mut config.quality;
        quality.enabled = env_parse("KEEL_QUALITY_ENABLED", quality.enabled);
        if let Some(url) = env_string("SONAR_URL") {
            quality.url = url;
        }
        quality.username = env_string("SONAR_USERNAME");
        quality.password = env_string("SONAR_PASSWORD");

        config.scan = env_string("KEEL_SCAN_COMMAND").map(|command| ScanConfig {
            command,
            delay: env_secs("KEEL_SCAN_DELAY", Duration::from_secs(15)),
        });

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace_base.as_os_str().is_empty() {
            anyhow::bail!("workspace_base cannot be empty");
        }

        if self.build.command.trim().is_empty() {
            anyhow::bail!("build command cannot be empty");
        }

        if !self.build.image_command.contains("{image}") {
            anyhow::bail!("image build command must reference {{image}}");
        }

        if self.log_flush_interval.is_zero() {
            anyhow::bail!("log_flush_interval must be greater than 0");
        }

        if self.max_parallel_runs == 0 {
            anyhow::bail!("max_parallel_runs must be greater than 0");
        }

        if !(1..=65535).contains(&self.deployment.app_port) {
            anyhow::bail!("app_port must be between 1 and 65535");
        }

        if self.deployment.poll_interval.is_zero() {
            anyhow::bail!("readiness poll_interval must be greater than 0");
        }

        if self.quality.enabled
            && !self.quality.url.starts_with("http://")
            && !self.quality.url.starts_with("https://")
        {
            anyhow::bail!("quality url must start with http:// or https://");
        }

        match self.target {
            TargetKind::Cluster => {
                if self.cluster.namespace.is_empty() {
                    anyhow::bail!("namespace cannot be empty");
                }
                for sidecar in &self.cluster.sidecars {
                    if sidecar.name.is_empty() || sidecar.image.is_empty() {
                        anyhow::bail!("sidecars need both a name and an image");
                    }
                }
            }
            TargetKind::Remote => {
                if self.remote.host.is_empty() {
                    anyhow::bail!("VM_HOST must be set for the remote target");
                }
                if self.remote.user.is_empty() {
                    anyhow::bail!("remote user cannot be empty");
                }
            }
        }

        if let Some(scan) = &self.scan {
            if scan.command.trim().is_empty() {
                anyhow::bail!("scan command cannot be empty");
            }
        }

        Ok(())
    }

    /// Image repository for an application, honoring the image prefix
    pub fn image_repository(&self, app: &str) -> String {
        let prefix = self.build.image_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            app.to_string()
        } else {
            format!("{}/{}", prefix, app)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(TargetKind::Cluster)
    }
}

/// Parses the `KEEL_SIDECARS` JSON array
pub fn parse_sidecars(raw: &str) -> anyhow::Result<Vec<SidecarSpec>> {
    serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("invalid sidecar declaration: {}", e))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
