//! Kubernetes object builders
//!
//! Pure functions from configuration to API objects. Every object carries
//! the `app`, `version` and `managed-by` labels; pods are selected by `app`
//! and `version`, so a Service always points at exactly one release.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, LocalObjectReference, Namespace, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Secret, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

use crate::config::{Config, ProbeTiming, SidecarSpec};
use crate::error::{PipelineError, Result};
use crate::target::{ImageRef, replace_tag};

pub const MANAGED_BY: &str = "keel";
pub const PORT_NAME: &str = "http";

/// Identity of one release of an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release<'a> {
    pub namespace: &'a str,
    pub app: &'a str,
    pub version: &'a str,
}

pub fn labels(app: &str, version: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), app.to_string()),
        ("version".to_string(), version.to_string()),
        ("managed-by".to_string(), MANAGED_BY.to_string()),
    ])
}

pub fn selector(app: &str, version: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), app.to_string()),
        ("version".to_string(), version.to_string()),
    ])
}

pub fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                "managed-by".to_string(),
                MANAGED_BY.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Deployment and Service for one release
pub fn build_manifests(config: &Config, release: &Release<'_>, image: &ImageRef) -> (Deployment, Service) {
    (build_deployment(config, release, image), build_service(config, release))
}

pub fn build_deployment(config: &Config, release: &Release<'_>, image: &ImageRef) -> Deployment {
    let labels = labels(release.app, release.version);

    let mut containers = vec![app_container(config, release.app, image)];
    containers.extend(config.cluster.sidecars.iter().map(sidecar_container));

    let image_pull_secrets = config.registry.credentials().map(|_| {
        vec![LocalObjectReference {
            name: config.cluster.pull_secret_name.clone(),
        }]
    });

    Deployment {
        metadata: ObjectMeta {
            name: Some(release.app.to_string()),
            namespace: Some(release.namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector(release.app, release.version)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    image_pull_secrets,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_service(config: &Config, release: &Release<'_>) -> Service {
    let port = config.deployment.app_port;

    Service {
        metadata: ObjectMeta {
            name: Some(release.app.to_string()),
            namespace: Some(release.namespace.to_string()),
            labels: Some(labels(release.app, release.version)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(config.cluster.service_type.clone()),
            selector: Some(selector(release.app, release.version)),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME.to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn app_container(config: &Config, app: &str, image: &ImageRef) -> Container {
    let port = config.deployment.app_port;
    let health = &config.deployment.health;

    // Requests equal limits: guaranteed QoS.
    let resources = BTreeMap::from([
        ("cpu".to_string(), Quantity(config.cluster.default_cpu.clone())),
        ("memory".to_string(), Quantity(config.cluster.default_memory.clone())),
    ]);

    let (liveness_probe, readiness_probe) = if health.enabled {
        (
            Some(http_probe(&health.liveness_path, port, &health.liveness)),
            Some(http_probe(&health.readiness_path, port, &health.readiness)),
        )
    } else {
        (None, None)
    };

    Container {
        name: app.to_string(),
        image: Some(image.reference()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some(PORT_NAME.to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(resources.clone()),
            limits: Some(resources),
            ..Default::default()
        }),
        liveness_probe,
        readiness_probe,
        ..Default::default()
    }
}

fn sidecar_container(sidecar: &SidecarSpec) -> Container {
    let env: Vec<EnvVar> = sidecar
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    Container {
        name: sidecar.name.clone(),
        image: Some(sidecar.image.clone()),
        ports: sidecar.port.map(|port| {
            vec![ContainerPort {
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]
        }),
        env: if env.is_empty() { None } else { Some(env) },
        ..Default::default()
    }
}

fn http_probe(path: &str, port: i32, timing: &ProbeTiming) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(timing.initial_delay),
        period_seconds: Some(timing.period),
        timeout_seconds: Some(timing.timeout),
        failure_threshold: Some(timing.failure_threshold),
        ..Default::default()
    }
}

/// Image pull secret in `kubernetes.io/dockerconfigjson` format
pub fn registry_secret(
    name: &str,
    namespace: &str,
    registry_url: &str,
    username: &str,
    password: &str,
) -> Secret {
    let auth = STANDARD.encode(format!("{}:{}", username, password));
    let docker_config = serde_json::json!({
        "auths": {
            registry_url: {
                "username": username,
                "password": password,
                "auth": auth,
            }
        }
    });

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "managed-by".to_string(),
                MANAGED_BY.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(docker_config.to_string().into_bytes()),
        )])),
        ..Default::default()
    }
}

/// Points a live deployment at another version
///
/// Rewrites the app container image tag and the `version` label in the
/// object metadata, the selector and the pod template. Server-populated
/// fields are cleared so the object can be created again. Returns the
/// new image reference.
pub fn retarget_deployment(deployment: &mut Deployment, app: &str, version: &str) -> Result<String> {
    let missing = |what: &str| PipelineError::ResourceMissing(format!("{} in deployment {}", what, app));

    deployment.metadata.resource_version = None;
    deployment.metadata.uid = None;
    deployment.metadata.creation_timestamp = None;
    deployment.metadata.managed_fields = None;
    deployment.metadata.generation = None;
    deployment.status = None;
    set_version(&mut deployment.metadata.labels, version);

    let spec = deployment.spec.as_mut().ok_or_else(|| missing("spec"))?;
    set_version(&mut spec.selector.match_labels, version);

    let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
    set_version(&mut template_meta.labels, version);

    let pod = spec.template.spec.as_mut().ok_or_else(|| missing("pod spec"))?;
    let container = pod
        .containers
        .iter_mut()
        .find(|c| c.name == app)
        .ok_or_else(|| missing("app container"))?;
    let current = container.image.as_deref().ok_or_else(|| missing("container image"))?;

    let image = replace_tag(current, version);
    container.image = Some(image.clone());
    Ok(image)
}

fn set_version(labels: &mut Option<BTreeMap<String, String>>, version: &str) {
    labels
        .get_or_insert_with(BTreeMap::new)
        .insert("version".to_string(), version.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SidecarSpec;

    fn release() -> Release<'static> {
        Release {
            namespace: "keel-shop",
            app: "shop",
            version: "1111",
        }
    }

    fn image() -> ImageRef {
        ImageRef::new("registry.local:5000/shop", "1111")
    }

    fn app_container_of(deployment: &Deployment) -> &Container {
        let pod = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        pod.containers.iter().find(|c| c.name == "shop").unwrap()
    }

    #[test]
    fn selector_matches_pod_labels() {
        let (deployment, service) = build_manifests(&Config::default(), &release(), &image());
        let spec = deployment.spec.as_ref().unwrap();

        let pod_labels = spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        let match_labels = spec.selector.match_labels.as_ref().unwrap();
        for (key, value) in match_labels {
            assert_eq!(pod_labels.get(key), Some(value));
        }
        assert_eq!(service.spec.as_ref().unwrap().selector.as_ref(), Some(match_labels));
        assert_eq!(pod_labels.get("managed-by").map(String::as_str), Some("keel"));
        assert_eq!(pod_labels.get("version").map(String::as_str), Some("1111"));
    }

    #[test]
    fn single_replica_with_equal_requests_and_limits() {
        let (deployment, _) = build_manifests(&Config::default(), &release(), &image());
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));

        let container = app_container_of(&deployment);
        assert_eq!(container.image.as_deref(), Some("registry.local:5000/shop:1111"));
        let resources = container.resources.as_ref().unwrap();
        assert_eq!(resources.requests, resources.limits);
        let requests = resources.requests.as_ref().unwrap();
        assert_eq!(requests.get("cpu"), Some(&Quantity("250m".to_string())));
        assert_eq!(requests.get("memory"), Some(&Quantity("256Mi".to_string())));
    }

    #[test]
    fn probes_follow_health_settings() {
        let config = Config::default();
        let (deployment, _) = build_manifests(&config, &release(), &image());
        let container = app_container_of(&deployment);

        let liveness = container.liveness_probe.as_ref().unwrap();
        assert_eq!(
            liveness.http_get.as_ref().unwrap().path.as_deref(),
            Some("/actuator/health")
        );
        assert_eq!(liveness.initial_delay_seconds, Some(60));
        let readiness = container.readiness_probe.as_ref().unwrap();
        assert_eq!(
            readiness.http_get.as_ref().unwrap().path.as_deref(),
            Some("/actuator/health/readiness")
        );
        assert_eq!(readiness.period_seconds, Some(5));

        let mut disabled = Config::default();
        disabled.deployment.health.enabled = false;
        let (deployment, _) = build_manifests(&disabled, &release(), &image());
        let container = app_container_of(&deployment);
        assert!(container.liveness_probe.is_none());
        assert!(container.readiness_probe.is_none());
    }

    #[test]
    fn pull_secret_only_with_credentials() {
        let mut config = Config::default();
        let (deployment, _) = build_manifests(&config, &release(), &image());
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert!(pod.image_pull_secrets.is_none());

        config.registry.username = Some("ci".to_string());
        config.registry.password = Some("secret".to_string());
        let (deployment, _) = build_manifests(&config, &release(), &image());
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, "registry-secret");
    }

    #[test]
    fn sidecars_run_next_to_the_app() {
        let mut config = Config::default();
        config.cluster.sidecars = vec![SidecarSpec {
            name: "redis".to_string(),
            image: "redis:7".to_string(),
            port: Some(6379),
            env: BTreeMap::from([("MODE".to_string(), "cache".to_string())]),
        }];

        let (deployment, _) = build_manifests(&config, &release(), &image());
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers.len(), 2);
        let redis = &pod.containers[1];
        assert_eq!(redis.image.as_deref(), Some("redis:7"));
        assert_eq!(redis.ports.as_ref().unwrap()[0].container_port, 6379);
        assert_eq!(redis.env.as_ref().unwrap()[0].name, "MODE");
    }

    #[test]
    fn service_exposes_app_port() {
        let mut config = Config::default();
        config.cluster.service_type = "NodePort".to_string();
        let service = build_service(&config, &release());
        let spec = service.spec.unwrap();

        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 8080);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
        assert_eq!(port.name.as_deref(), Some("http"));
    }

    #[test]
    fn registry_secret_is_docker_config_json() {
        let secret = registry_secret("registry-secret", "keel-shop", "registry.local", "ci", "pw");
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));

        let raw = &secret.data.as_ref().unwrap()[".dockerconfigjson"];
        let parsed: serde_json::Value = serde_json::from_slice(&raw.0).unwrap();
        let entry = &parsed["auths"]["registry.local"];
        assert_eq!(entry["username"], "ci");
        assert_eq!(entry["auth"], STANDARD.encode("ci:pw"));
    }

    #[test]
    fn retarget_rewrites_image_and_version_labels() {
        let (mut deployment, _) = build_manifests(&Config::default(), &release(), &image());
        deployment.metadata.resource_version = Some("42".to_string());

        let new_image = retarget_deployment(&mut deployment, "shop", "0000").unwrap();

        assert_eq!(new_image, "registry.local:5000/shop:0000");
        assert!(deployment.metadata.resource_version.is_none());
        assert_eq!(app_container_of(&deployment).image.as_deref(), Some(new_image.as_str()));

        let version = |labels: &Option<BTreeMap<String, String>>| {
            labels.as_ref().unwrap().get("version").cloned()
        };
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(version(&deployment.metadata.labels).as_deref(), Some("0000"));
        assert_eq!(version(&spec.selector.match_labels).as_deref(), Some("0000"));
        assert_eq!(
            version(&spec.template.metadata.as_ref().unwrap().labels).as_deref(),
            Some("0000")
        );
    }

    #[test]
    fn retarget_requires_app_container() {
        let (mut deployment, _) = build_manifests(&Config::default(), &release(), &image());
        let err = retarget_deployment(&mut deployment, "other", "0000").unwrap_err();
        assert!(matches!(err, PipelineError::ResourceMissing(_)));
    }
}
