//! Source checkout

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Checks out a branch of a repository into a directory
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, repo_url: &str, branch: &str, dest: &Path) -> Result<()>;
}

/// Fetcher backed by the system `git` client
///
/// Clones shallowly; a stale destination is removed first.
#[derive(Debug, Clone, Default)]
pub struct GitSourceFetcher;

impl GitSourceFetcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SourceFetcher for GitSourceFetcher {
    async fn fetch(&self, repo_url: &str, branch: &str, dest: &Path) -> Result<()> {
        if dest.exists() {
            debug!("Removing stale checkout at {}", dest.display());
            tokio::fs::remove_dir_all(dest).await?;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Cloning {} (branch {}) into {}", repo_url, branch, dest.display());

        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--single-branch", "--branch", branch, repo_url])
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(|e| PipelineError::SourceFetch(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::SourceFetch(format!(
                "git clone of {} ({}) failed: {}",
                repo_url,
                branch,
                stderr.trim()
            )));
        }

        Ok(())
    }
}
