//! Notification payloads and topic naming

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::execution::Execution;

const TOPIC_PREFIX: &str = "/topic/pipeline";

/// Topic carrying full execution snapshots.
pub fn state_topic(execution_id: Uuid) -> String {
    format!("{}/{}", TOPIC_PREFIX, execution_id)
}

/// Topic carrying individual log lines.
pub fn log_topic(execution_id: Uuid) -> String {
    format!("{}/{}/logs", TOPIC_PREFIX, execution_id)
}

/// One log line as streamed to observers.
///
/// `seq` starts at 1 and increases by one per line within an execution, so
/// observers can detect gaps and reorder if the transport does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub execution_id: Uuid,
    pub seq: u64,
    pub line: String,
}

/// Message published on a pipeline topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    State(Execution),
    Log(LogLine),
}
