//! Deployment targets
//!
//! A target receives the built image, runs it, and can put a previous
//! version back. Exactly one target is active per engine.

pub mod cluster;
pub mod remote;

use async_trait::async_trait;
use keel_core::domain::execution::Execution;

use crate::context::ExecutionContext;
use crate::error::Result;

pub use cluster::ClusterDeployer;
pub use remote::RemoteHostDeployer;

/// Image repository plus tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Same repository, `latest` tag
    pub fn latest(&self) -> Self {
        self.with_tag("latest")
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self::new(self.repository.clone(), tag)
    }

    /// `repository:tag`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Replaces the tag of a full image reference
///
/// A `:` only starts a tag after the last `/`, so registry ports survive.
/// Digests are dropped.
pub fn replace_tag(image: &str, tag: &str) -> String {
    let without_digest = image.split('@').next().unwrap_or(image);
    let name_start = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let repository = match without_digest[name_start..].find(':') {
        Some(i) => &without_digest[..name_start + i],
        None => without_digest,
    };
    format!("{}:{}", repository, tag)
}

/// Backend that delivers and runs images
#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    fn name(&self) -> &'static str;

    /// Makes the image available to the target (registry push, archive copy)
    async fn deliver(&self, ctx: &ExecutionContext, image: &ImageRef) -> Result<()>;

    /// Runs the image and waits until it is ready; returns its endpoint
    async fn deploy(&self, ctx: &ExecutionContext, image: &ImageRef) -> Result<String>;

    /// Redeploys the image built by `previous`
    async fn rollback(&self, ctx: &ExecutionContext, previous: &Execution) -> Result<ImageRef>;
}
