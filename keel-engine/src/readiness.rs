//! Deployment readiness polling
//!
//! Both deployment targets share one loop: poll until the desired replicas
//! are all ready, keep polling through a final grace window after the
//! timeout, and collect diagnostics when the deployment still is not ready.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::config::DeploymentConfig;
use crate::error::{PipelineError, Result};
use crate::sink::LogSink;

/// Desired and ready replica counts of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicaCounts {
    pub desired: i32,
    pub ready: i32,
}

impl ReplicaCounts {
    pub fn new(desired: i32, ready: i32) -> Self {
        Self { desired, ready }
    }

    /// Ready means at least one replica is desired and all of them are ready
    pub fn is_ready(&self) -> bool {
        self.desired > 0 && self.ready == self.desired
    }
}

/// Observes one deployment
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Name used in log lines and errors
    fn target(&self) -> String;

    async fn replica_counts(&self) -> Result<ReplicaCounts>;

    /// Detail lines logged on every poll (pod phases, conditions, events)
    async fn progress(&self) -> Vec<String>;

    /// Evidence collected once the deployment has failed to become ready
    async fn diagnostics(&self) -> Vec<String>;
}

/// Timing of the readiness loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub final_wait: Duration,
}

impl From<&DeploymentConfig> for ReadinessPolicy {
    fn from(config: &DeploymentConfig) -> Self {
        Self {
            timeout: config.timeout,
            poll_interval: config.poll_interval,
            final_wait: config.final_wait,
        }
    }
}

/// Polls `probe` until ready or until the timeout and final wait expire
pub async fn wait_ready(
    probe: &dyn ReadinessProbe,
    policy: &ReadinessPolicy,
    sink: &dyn LogSink,
) -> Result<()> {
    let target = probe.target();

    sink.line(&format!(
        "Waiting up to {}s for {} to become ready",
        policy.timeout.as_secs(),
        target
    ))
    .await;

    if poll_until(probe, &target, sink, policy, Instant::now() + policy.timeout, true).await {
        sink.line(&format!("{} is ready", target)).await;
        return Ok(());
    }

    sink.line(&format!(
        "{} not ready after {}s; waiting up to {}s more",
        target,
        policy.timeout.as_secs(),
        policy.final_wait.as_secs()
    ))
    .await;

    if poll_until(probe, &target, sink, policy, Instant::now() + policy.final_wait, false).await {
        sink.line(&format!("{} became ready during the final wait", target))
            .await;
        return Ok(());
    }

    let mut diagnostics = vec![format!(
        "Deployment {} did not become ready within {}s",
        target,
        policy.timeout.as_secs()
    )];
    diagnostics.extend(probe.diagnostics().await);

    for line in &diagnostics {
        sink.line(line).await;
    }

    Err(PipelineError::DeploymentNotReady {
        deployment: target,
        timeout: policy.timeout,
        diagnostics,
    })
}

/// Checks every poll interval until ready or `deadline`, checking at least once
async fn poll_until(
    probe: &dyn ReadinessProbe,
    target: &str,
    sink: &dyn LogSink,
    policy: &ReadinessPolicy,
    deadline: Instant,
    with_progress: bool,
) -> bool {
    loop {
        if check_once(probe, target, sink, with_progress).await {
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(policy.poll_interval.min(deadline - now)).await;
    }
}

async fn check_once(
    probe: &dyn ReadinessProbe,
    target: &str,
    sink: &dyn LogSink,
    with_progress: bool,
) -> bool {
    match probe.replica_counts().await {
        Ok(counts) => {
            sink.line(&format!(
                "Replicas ready: {}/{}",
                counts.ready, counts.desired
            ))
            .await;
            if counts.is_ready() {
                return true;
            }
            if with_progress {
                for line in probe.progress().await {
                    sink.line(&line).await;
                }
            }
            false
        }
        Err(e) => {
            // Transient API failures keep the loop going.
            warn!("Readiness check for {} failed: {}", target, e);
            sink.line(&format!("Readiness check failed: {}", e)).await;
            debug!("Retrying readiness check for {}", target);
            false
        }
    }
}
