//! Execution ID resolution
//!
//! Accepts a full UUID or an unambiguous prefix of one.

use anyhow::{Context, Result, anyhow};
use keel_engine::store::ExecutionStore;
use uuid::Uuid;

/// Resolve an execution ID or prefix to a full UUID
pub async fn resolve_execution_id(store: &dyn ExecutionStore, input: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(input) {
        return Ok(uuid);
    }

    let executions = store
        .list()
        .await
        .context("Failed to fetch executions for ID resolution")?;

    match_prefix(executions.iter().map(|e| e.id), input)
}

fn match_prefix(ids: impl Iterator<Item = Uuid>, input: &str) -> Result<Uuid> {
    let prefix = input.to_lowercase();
    if prefix.is_empty() {
        return Err(anyhow!("Execution ID cannot be empty"));
    }

    let matches: Vec<Uuid> = ids
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No execution found with ID starting with '{}'", prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(|id| id.to_string()).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple executions: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}
