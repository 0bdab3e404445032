//! Execution store contract
//!
//! The engine reads and writes execution records only through this trait.
//! `keel-store` provides the PostgreSQL implementation; the in-memory one
//! serves single-process runs and tests.

use anyhow::Result;
use async_trait::async_trait;
use keel_core::domain::execution::{Execution, ExecutionStatus};
use keel_core::domain::source::SourceRef;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence for execution records
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Creates a PENDING execution for the given source
    async fn create(&self, source: SourceRef) -> Result<Execution>;

    async fn get(&self, id: Uuid) -> Result<Option<Execution>>;

    /// Writes the full record, replacing the stored one
    async fn save(&self, execution: &Execution) -> Result<()>;

    /// Most recent successful execution for the same repository, by start time
    async fn find_latest_success(&self, source: &SourceRef) -> Result<Option<Execution>>;

    /// All executions, newest first
    async fn list(&self) -> Result<Vec<Execution>>;
}

/// Store keeping every record in process memory
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<Uuid, Execution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, source: SourceRef) -> Result<Execution> {
        let execution = Execution::new(source);
        self.executions
            .write()
            .await
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn save(&self, execution: &Execution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn find_latest_success(&self, source: &SourceRef) -> Result<Option<Execution>> {
        let executions = self.executions.read().await;
        Ok(executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Success)
            .filter(|e| e.source.repo_url == source.repo_url)
            .max_by_key(|e| e.start_time)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Execution>> {
        let mut executions: Vec<Execution> =
            self.executions.read().await.values().cloned().collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn source(repo: &str) -> SourceRef {
        SourceRef::new(repo, "main")
    }

    async fn finished(
        store: &InMemoryExecutionStore,
        repo: &str,
        status: ExecutionStatus,
        started_minutes_ago: i64,
    ) -> Execution {
        let mut execution = store.create(source(repo)).await.unwrap();
        execution.start().unwrap();
        execution.start_time = Some(Utc::now() - Duration::minutes(started_minutes_ago));
        execution.finish(status).unwrap();
        execution.close().unwrap();
        store.save(&execution).await.unwrap();
        execution
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = InMemoryExecutionStore::new();
        let created = store.create(source("https://h/a.git")).await.unwrap();
        let loaded = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.status, ExecutionStatus::Pending);
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_success_picks_most_recent_start() {
        let store = InMemoryExecutionStore::new();
        let repo = "https://h/a.git";
        let older = finished(&store, repo, ExecutionStatus::Success, 30).await;
        let newer = finished(&store, repo, ExecutionStatus::Success, 10).await;
        finished(&store, repo, ExecutionStatus::Failed, 1).await;
        finished(&store, "https://h/other.git", ExecutionStatus::Success, 0).await;

        let found = store.find_latest_success(&source(repo)).await.unwrap().unwrap();
        assert_eq!(found.id, newer.id);
        assert_ne!(found.id, older.id);
    }

    #[tokio::test]
    async fn latest_success_ignores_branch() {
        let store = InMemoryExecutionStore::new();
        let repo = "https://h/a.git";
        let success = finished(&store, repo, ExecutionStatus::Success, 5).await;

        let other_branch = SourceRef::new(repo, "feature");
        let found = store.find_latest_success(&other_branch).await.unwrap();
        assert_eq!(found.map(|e| e.id), Some(success.id));
    }

    #[tokio::test]
    async fn no_success_yields_none() {
        let store = InMemoryExecutionStore::new();
        finished(&store, "https://h/a.git", ExecutionStatus::Failed, 5).await;
        assert!(
            store
                .find_latest_success(&source("https://h/a.git"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = InMemoryExecutionStore::new();
        let mut first = store.create(source("https://h/a.git")).await.unwrap();
        first.created_at = Utc::now() - Duration::minutes(5);
        store.save(&first).await.unwrap();
        let second = store.create(source("https://h/b.git")).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }
}
