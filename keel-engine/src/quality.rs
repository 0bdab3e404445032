//! Quality gate
//!
//! Queries a SonarQube-compatible service for the gate status of a project.
//! Only an explicit `ERROR` status fails the gate.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::QualityConfig;
use crate::error::{PipelineError, Result};

/// Pass/fail verdict for a project
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn verify(&self, project_key: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectStatusResponse {
    project_status: Option<ProjectStatus>,
}

#[derive(Debug, Deserialize)]
struct ProjectStatus {
    status: Option<String>,
}

/// Applies the gate rule to a `project_status` response body
pub fn evaluate(project_key: &str, body: &str) -> Result<()> {
    let response: ProjectStatusResponse = serde_json::from_str(body)
        .map_err(|e| PipelineError::QualityService(format!("invalid response: {}", e)))?;

    let status = response
        .project_status
        .and_then(|s| s.status)
        .ok_or_else(|| {
            PipelineError::QualityService("response has no projectStatus.status".to_string())
        })?;

    if status == "ERROR" {
        return Err(PipelineError::QualityGate {
            project_key: project_key.to_string(),
            status,
        });
    }

    Ok(())
}

/// Gate backed by the SonarQube web API
#[derive(Debug, Clone)]
pub struct SonarQualityGate {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl SonarQualityGate {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

#[async_trait]
impl QualityGate for SonarQualityGate {
    async fn verify(&self, project_key: &str) -> Result<()> {
        let url = format!("{}/api/qualitygates/project_status", self.base_url);
        debug!("Querying quality gate for {} at {}", project_key, url);

        let mut request = self.client.get(&url).query(&[("projectKey", project_key)]);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::QualityService(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::QualityService(format!("failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(PipelineError::QualityService(format!(
                "HTTP {} from {}: {}",
                status.as_u16(),
                url,
                body.trim()
            )));
        }

        evaluate(project_key, &body)?;
        info!("Quality gate passed for {}", project_key);
        Ok(())
    }
}
