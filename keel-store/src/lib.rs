//! Keel Store
//!
//! PostgreSQL persistence for execution records. The repository functions
//! take a pool directly; [`PgExecutionStore`] exposes them to the engine
//! through the `ExecutionStore` contract.

pub mod db;
pub mod repository;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_core::domain::execution::Execution;
use keel_core::domain::source::SourceRef;
use keel_engine::store::ExecutionStore;
use sqlx::PgPool;
use uuid::Uuid;

pub use db::{create_pool, run_migrations};

/// Execution store backed by PostgreSQL
#[derive(Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and brings the schema up to date
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url)
            .await
            .context("Failed to connect to database")?;
        run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn create(&self, source: SourceRef) -> Result<Execution> {
        repository::create(&self.pool, source)
            .await
            .context("Failed to create execution")
    }

    async fn get(&self, id: Uuid) -> Result<Option<Execution>> {
        repository::find_by_id(&self.pool, id)
            .await
            .with_context(|| format!("Failed to load execution {}", id))
    }

    async fn save(&self, execution: &Execution) -> Result<()> {
        repository::save(&self.pool, execution)
            .await
            .with_context(|| format!("Failed to save execution {}", execution.id))
    }

    async fn find_latest_success(&self, source: &SourceRef) -> Result<Option<Execution>> {
        repository::find_latest_success(&self.pool, &source.repo_url)
            .await
            .with_context(|| format!("Failed to look up last success for {}", source.repo_url))
    }

    async fn list(&self) -> Result<Vec<Execution>> {
        repository::list_all(&self.pool)
            .await
            .context("Failed to list executions")
    }
}
