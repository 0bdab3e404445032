//! Execution context for pipeline runs
//!
//! Contains all state needed while one execution is in flight:
//! - The execution record, mutated only through this context
//! - The private workspace directory
//! - Handles to the store (persistence) and notifier (live observers)
//!
//! Log lines are appended in memory and broadcast immediately. Persistence
//! happens at state changes, periodically through the flusher, and at the end.

use keel_core::domain::execution::{Execution, ExecutionStatus, TransitionError};
use keel_core::domain::source::SourceRef;
use keel_core::dto::notification::{LogLine, Notification, log_topic, state_topic};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::{self, Duration};
use tracing::{debug, error};
use uuid::Uuid;

use async_trait::async_trait;

use crate::notify::Notifier;
use crate::sink::LogSink;
use crate::store::ExecutionStore;

/// Execution context shared by every stage of one run
pub struct ExecutionContext {
    id: Uuid,
    source: SourceRef,
    workspace: PathBuf,
    execution: Mutex<Execution>,
    seq: AtomicU64,
    store: Arc<dyn ExecutionStore>,
    notifier: Arc<dyn Notifier>,
}

impl ExecutionContext {
    /// Creates a context for `execution`
    ///
    /// The workspace is `<workspace_base>/<execution id>`; it is not created here.
    pub fn new(
        execution: Execution,
        workspace_base: &Path,
        store: Arc<dyn ExecutionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: execution.id,
            source: execution.source.clone(),
            workspace: workspace_base.join(execution.id.to_string()),
            execution: Mutex::new(execution),
            seq: AtomicU64::new(0),
            store,
            notifier,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &SourceRef {
        &self.source
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Appends a line to the execution log and broadcasts it
    ///
    /// The record lock is held while publishing, so observers receive lines
    /// in `seq` order even with concurrent writers.
    pub async fn log(&self, line: &str) {
        let mut execution = self.execution.lock().await;
        execution.append_log(line);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        debug!("[{}] {}", self.id, line);

        self.notifier
            .publish(
                &log_topic(self.id),
                Notification::Log(LogLine {
                    execution_id: self.id,
                    seq,
                    line: line.to_string(),
                }),
            )
            .await;
        drop(execution);
    }

    /// Current copy of the execution record
    pub async fn snapshot(&self) -> Execution {
        self.execution.lock().await.clone()
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.execution.lock().await.status
    }

    /// PENDING -> RUNNING
    pub async fn start(&self) -> Result<(), TransitionError> {
        self.execution.lock().await.start()
    }

    /// RUNNING -> SUCCESS | FAILED
    pub async fn finish(&self, outcome: ExecutionStatus) -> Result<(), TransitionError> {
        self.execution.lock().await.finish(outcome)
    }

    /// Stamps the end time once the outcome is set
    pub async fn close(&self) -> Result<(), TransitionError> {
        self.execution.lock().await.close()
    }

    /// Broadcasts the full record on the state topic
    pub async fn publish_state(&self) {
        let snapshot = self.snapshot().await;
        self.notifier
            .publish(&state_topic(self.id), Notification::State(snapshot))
            .await;
    }

    /// Writes the current record to the store
    pub async fn persist(&self) -> anyhow::Result<()> {
        let snapshot = self.snapshot().await;
        self.store.save(&snapshot).await
    }

    /// Spawns a background task persisting the record every `interval`
    ///
    /// The caller aborts the returned handle when the run ends.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let context = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                debug!("Flushing execution {}", context.id);
                if let Err(e) = context.persist().await {
                    error!("Failed to persist execution {}: {:#}", context.id, e);
                }
            }
        })
    }
}

#[async_trait]
impl LogSink for ExecutionContext {
    async fn line(&self, line: &str) {
        self.log(line).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastNotifier;
    use crate::store::InMemoryExecutionStore;

    async fn context() -> (Arc<ExecutionContext>, Arc<InMemoryExecutionStore>, BroadcastNotifier) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let notifier = BroadcastNotifier::default();
        let execution = store
            .create(SourceRef::new("https://h/shop.git", "main"))
            .await
            .unwrap();
        let ctx = ExecutionContext::new(
            execution,
            Path::new("/tmp/keel"),
            store.clone(),
            Arc::new(notifier.clone()),
        );
        (ctx, store, notifier)
    }

    #[tokio::test]
    async fn workspace_is_scoped_by_id() {
        let (ctx, _, _) = context().await;
        assert_eq!(ctx.workspace(), Path::new("/tmp/keel").join(ctx.id().to_string()));
    }

    #[tokio::test]
    async fn log_lines_are_appended_and_broadcast_in_order() {
        let (ctx, _, notifier) = context().await;
        let mut rx = notifier.subscribe();

        ctx.log("one").await;
        ctx.line("two").await;

        assert_eq!(ctx.snapshot().await.logs, "one\ntwo\n");
        for (expected_seq, expected_line) in [(1, "one"), (2, "two")] {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.topic, log_topic(ctx.id()));
            match message.notification {
                Notification::Log(line) => {
                    assert_eq!(line.seq, expected_seq);
                    assert_eq!(line.line, expected_line);
                }
                other => panic!("unexpected notification: {:?}", other),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_broadcast_in_seq_order() {
        let (ctx, _, notifier) = context().await;
        let mut rx = notifier.subscribe();

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    for i in 0..50 {
                        ctx.log(&format!("writer {} line {}", w, i)).await;
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut seqs = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Notification::Log(line) = message.notification {
                seqs.push(line.seq);
            }
        }
        assert_eq!(seqs, (1..=400).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn persist_writes_snapshot() {
        let (ctx, store, _) = context().await;
        ctx.start().await.unwrap();
        ctx.log("building").await;
        ctx.persist().await.unwrap();

        let stored = store.get(ctx.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);
        assert_eq!(stored.logs, "building\n");
    }

    #[tokio::test]
    async fn flusher_persists_periodically() {
        let (ctx, store, _) = context().await;
        let flusher = ctx.spawn_flusher(Duration::from_millis(10));
        ctx.log("in flight").await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        flusher.abort();

        let stored = store.get(ctx.id()).await.unwrap().unwrap();
        assert_eq!(stored.logs, "in flight\n");
    }

    #[tokio::test]
    async fn state_is_published_on_state_topic() {
        let (ctx, _, notifier) = context().await;
        let mut rx = notifier.subscribe();
        ctx.publish_state().await;

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, state_topic(ctx.id()));
        assert!(matches!(message.notification, Notification::State(ref e) if e.id == ctx.id()));
    }
}
