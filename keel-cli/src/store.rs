//! Execution store selection
//!
//! PostgreSQL when a database URL is configured, process memory otherwise.

use anyhow::{Result, anyhow};
use keel_engine::store::{ExecutionStore, InMemoryExecutionStore};
use keel_store::PgExecutionStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::Settings;

pub async fn open(settings: &Settings) -> Result<Arc<dyn ExecutionStore>> {
    match &settings.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let store = connect_with_retry(url).await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; keeping executions in memory");
            Ok(Arc::new(InMemoryExecutionStore::new()))
        }
    }
}

/// Connects with exponential backoff
///
/// The database may still be starting when keel runs next to it in a
/// container environment.
pub async fn connect_with_retry(url: &str) -> Result<PgExecutionStore> {
    const MAX_RETRIES: u32 = 5;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 8_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match PgExecutionStore::connect(url).await {
            Ok(store) => {
                if attempt > 1 {
                    info!("Connected to database after {} attempt(s)", attempt);
                }
                return Ok(store);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to connect to database after {} attempts", MAX_RETRIES);
                    return Err(anyhow!("Failed to open execution store: {:#}", e));
                }

                warn!(
                    "Failed to connect to database (attempt {}/{}): {:#}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
