//! Error types for the pipeline engine

use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that abort the current pipeline stage
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A local command exited with a non-zero status
    #[error("Command failed with exit code {exit_code}: {command}")]
    ExternalProcess { command: String, exit_code: i32 },

    /// A local command could not be started
    #[error("Failed to start command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A remote command exited with a non-zero status
    #[error("Remote command failed with exit code {exit_code}: {command}")]
    RemoteExec { command: String, exit_code: i32 },

    /// A file could not be copied to the remote host
    #[error("Failed to transfer {local} to {remote}: {reason}")]
    Transfer {
        local: String,
        remote: String,
        reason: String,
    },

    /// Repository checkout failed
    #[error("Failed to fetch source: {0}")]
    SourceFetch(String),

    /// The quality gate reported a failing status
    #[error("Quality gate failed for project '{project_key}' (status {status})")]
    QualityGate { project_key: String, status: String },

    /// The quality service could not be queried
    #[error("Quality service error: {0}")]
    QualityService(String),

    /// Kubernetes API call failed
    #[error("Cluster API error: {0}")]
    ClusterApi(#[from] kube::Error),

    /// Kubernetes client configuration could not be loaded
    #[error("Failed to load cluster configuration: {0}")]
    Kubeconfig(String),

    /// An expected cluster object does not exist
    #[error("Resource not found: {0}")]
    ResourceMissing(String),

    /// The deployment did not become ready in time
    #[error("Deployment {deployment} not ready after {timeout:?}")]
    DeploymentNotReady {
        deployment: String,
        timeout: Duration,
        diagnostics: Vec<String>,
    },

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_error_names_command_and_code() {
        let err = PipelineError::ExternalProcess {
            command: "./mvnw clean package".into(),
            exit_code: 1,
        };
        let message = err.to_string();
        assert!(message.contains("exit code 1"));
        assert!(message.contains("./mvnw clean package"));
    }

    #[test]
    fn not_ready_names_deployment() {
        let err = PipelineError::DeploymentNotReady {
            deployment: "keel-shop/shop".into(),
            timeout: Duration::from_secs(900),
            diagnostics: vec!["event: BackOff".into()],
        };
        assert_eq!(err.to_string(), "Deployment keel-shop/shop not ready after 900s");
    }
}
