//! Execution dispatcher
//!
//! A trigger creates the PENDING record and returns right away; a worker
//! receives the execution over a channel and spawns one task per run.
//! Concurrency is bounded by a semaphore, and runs for the same repository
//! can be serialized with a per-source lock.

use anyhow::{Context as AnyhowContext, Result, anyhow};
use keel_core::domain::execution::Execution;
use keel_core::domain::source::SourceRef;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::orchestrator::PipelineOrchestrator;
use crate::store::ExecutionStore;

/// Accepts triggers and runs executions in the background
pub struct Dispatcher {
    store: Arc<dyn ExecutionStore>,
    queue: mpsc::UnboundedSender<Execution>,
    worker: JoinHandle<()>,
}

impl Dispatcher {
    /// Spawns the worker loop
    pub fn start(
        orchestrator: Arc<PipelineOrchestrator>,
        store: Arc<dyn ExecutionStore>,
        config: &Config,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_runs));
        info!(
            "Starting dispatcher (max parallel runs: {}, serialize per source: {})",
            config.max_parallel_runs, config.serialize_per_source
        );
        let worker = tokio::spawn(worker_loop(
            orchestrator,
            rx,
            semaphore,
            config.serialize_per_source,
        ));

        Self {
            store,
            queue,
            worker,
        }
    }

    /// Creates a PENDING execution for `source` and queues it
    pub async fn trigger(&self, source: SourceRef) -> Result<Execution> {
        let execution = self
            .store
            .create(source)
            .await
            .context("Failed to create execution")?;

        self.queue
            .send(execution.clone())
            .map_err(|_| anyhow!("Dispatcher is not running"))?;

        info!("Queued execution {} for {}", execution.id, execution.source);
        Ok(execution)
    }

    /// Stops accepting triggers and waits for every queued run to finish
    pub async fn shutdown(self) {
        drop(self.queue);
        if let Err(e) = self.worker.await {
            warn!("Dispatcher worker panicked: {}", e);
        }
    }
}

/// Per-repository locks, dropped once no run holds or waits on them
#[derive(Default)]
struct SourceLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl SourceLocks {
    fn lock_for(&mut self, repo_url: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(repo_url.to_string()).or_default())
    }

    /// Removes locks that only the map still references
    fn prune(&mut self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

async fn worker_loop(
    orchestrator: Arc<PipelineOrchestrator>,
    mut rx: mpsc::UnboundedReceiver<Execution>,
    semaphore: Arc<Semaphore>,
    serialize_per_source: bool,
) {
    let mut source_locks = SourceLocks::default();
    let mut runs = JoinSet::new();

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(execution) = received else { break };
                let lock = serialize_per_source
                    .then(|| source_locks.lock_for(&execution.source.repo_url));
                let orchestrator = Arc::clone(&orchestrator);
                let semaphore = Arc::clone(&semaphore);

                runs.spawn(async move {
                    // Source lock first so queued runs of a busy repository hold no slot.
                    let _source_guard = match lock {
                        Some(lock) => Some(lock.lock_owned().await),
                        None => None,
                    };
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };

                    debug!("Running execution {}", execution.id);
                    orchestrator.run(execution.id).await;
                });
            }
            Some(finished) = runs.join_next(), if !runs.is_empty() => {
                if let Err(e) = finished {
                    warn!("Execution task panicked: {}", e);
                }
                source_locks.prune();
            }
        }
    }

    while let Some(finished) = runs.join_next().await {
        if let Err(e) = finished {
            warn!("Execution task panicked: {}", e);
        }
    }
    info!("Dispatcher stopped");
}
