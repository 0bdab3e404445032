//! Readiness probe backed by the Kubernetes API

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{ListParams, LogParams};
use kube::{Api, Client};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::readiness::{ReadinessProbe, ReplicaCounts};

/// Events shown per pod on each poll
const EVENTS_PER_POD: usize = 3;

/// Watches one deployment and the pods labeled with its app name
pub struct ClusterProbe {
    client: Client,
    namespace: String,
    name: String,
    log_lines: i64,
}

impl ClusterProbe {
    pub fn new(client: Client, namespace: &str, name: &str, log_lines: i64) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
            log_lines,
        }
    }

    async fn pods(&self) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().labels(&format!("app={}", self.name));
        Ok(pods.list(&params).await?.items)
    }

    /// Most recent events about one object, newest first
    async fn events_for(&self, object: &str, limit: usize) -> Result<Vec<String>> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().fields(&format!("involvedObject.name={}", object));
        let mut items = events.list(&params).await?.items;

        items.sort_by_key(|e| std::cmp::Reverse(e.last_timestamp.as_ref().map(|t| t.0)));
        Ok(items.iter().take(limit).map(format_event).collect())
    }
}

#[async_trait]
impl ReadinessProbe for ClusterProbe {
    fn target(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn replica_counts(&self) -> Result<ReplicaCounts> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let deployment = deployments
            .get_opt(&self.name)
            .await?
            .ok_or_else(|| PipelineError::ResourceMissing(format!("deployment {}", self.target())))?;

        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let ready = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);

        Ok(ReplicaCounts::new(desired, ready))
    }

    async fn progress(&self) -> Vec<String> {
        let pods = match self.pods().await {
            Ok(pods) => pods,
            Err(e) => return vec![format!("Failed to list pods: {}", e)],
        };

        let mut lines = Vec::new();
        for pod in &pods {
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            lines.push(describe_pod(pod));
            match self.events_for(&pod_name, EVENTS_PER_POD).await {
                Ok(events) => lines.extend(events.into_iter().map(|e| format!("  {}", e))),
                Err(e) => debug!("Failed to list events for {}: {}", pod_name, e),
            }
        }
        lines
    }

    async fn diagnostics(&self) -> Vec<String> {
        let mut lines = vec![format!("Events for deployment {}:", self.name)];
        match self.events_for(&self.name, usize::MAX).await {
            Ok(events) if events.is_empty() => lines.push("  (no events)".to_string()),
            Ok(events) => lines.extend(events.into_iter().map(|e| format!("  {}", e))),
            Err(e) => lines.push(format!("  Failed to list events: {}", e)),
        }

        let pods = match self.pods().await {
            Ok(pods) => pods,
            Err(e) => {
                lines.push(format!("Failed to list pods: {}", e));
                return lines;
            }
        };

        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        for pod in &pods {
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            lines.push(describe_pod(pod));
            lines.extend(waiting_reasons(pod));

            lines.push(format!(
                "Last {} log lines of pod {}:",
                self.log_lines, pod_name
            ));
            let params = LogParams {
                container: Some(self.name.clone()),
                tail_lines: Some(self.log_lines),
                ..Default::default()
            };
            match pod_api.logs(&pod_name, &params).await {
                Ok(logs) => lines.extend(logs.lines().map(|l| format!("  {}", l))),
                Err(e) => lines.push(format!("  Failed to fetch logs: {}", e)),
            }
        }
        lines
    }
}

fn describe_pod(pod: &Pod) -> String {
    let name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");

    let condition = |kind: &str| {
        status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| conditions.iter().find(|c| c.type_ == kind))
            .map(|c| c.status.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    };

    format!(
        "Pod {}: phase={}, Ready={}, ContainersReady={}",
        name,
        phase,
        condition("Ready"),
        condition("ContainersReady")
    )
}

fn waiting_reasons(pod: &Pod) -> Vec<String> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(|cs| {
                    let waiting = cs.state.as_ref()?.waiting.as_ref()?;
                    Some(format!(
                        "  Container {} waiting: {} {}",
                        cs.name,
                        waiting.reason.as_deref().unwrap_or("-"),
                        waiting.message.as_deref().unwrap_or("")
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn format_event(event: &Event) -> String {
    format!(
        "Event [{}] {}: {}",
        event.type_.as_deref().unwrap_or("Normal"),
        event.reason.as_deref().unwrap_or("-"),
        event.message.as_deref().unwrap_or("").trim()
    )
}
