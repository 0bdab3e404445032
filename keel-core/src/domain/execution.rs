//! Execution domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::source::SourceRef;

/// A single run of the pipeline against one source reference.
///
/// Structure shared between the engine (updates) and the store (persists).
/// Status changes go through [`Execution::start`] and [`Execution::finish`]
/// so that only `PENDING -> RUNNING -> {SUCCESS, FAILED}` is reachable.
/// The end time is stamped separately by [`Execution::close`] once all
/// post-outcome work (rollback included) is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub source: SourceRef,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub logs: String,
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// Rejected status transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition for execution {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: Uuid,
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

impl Execution {
    /// Creates a new PENDING execution.
    pub fn new(source: SourceRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            logs: String::new(),
        }
    }

    /// Moves a PENDING execution to RUNNING and stamps the start time.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        if self.status != ExecutionStatus::Pending {
            return Err(self.rejected(ExecutionStatus::Running));
        }
        self.status = ExecutionStatus::Running;
        self.start_time = Some(Utc::now());
        Ok(())
    }

    /// Moves a RUNNING execution to a terminal status.
    pub fn finish(&mut self, outcome: ExecutionStatus) -> Result<(), TransitionError> {
        if self.status != ExecutionStatus::Running || !outcome.is_terminal() {
            return Err(self.rejected(outcome));
        }
        self.status = outcome;
        Ok(())
    }

    /// Stamps the end time of a finished execution.
    ///
    /// Only the first call on a terminal execution has an effect.
    pub fn close(&mut self) -> Result<(), TransitionError> {
        if !self.status.is_terminal() {
            return Err(self.rejected(self.status));
        }
        if self.end_time.is_none() {
            let now = Utc::now();
            // Clock skew must not put the end before the start.
            self.end_time = Some(match self.start_time {
                Some(start) if start > now => start,
                _ => now,
            });
        }
        Ok(())
    }

    /// Appends one line to the execution log.
    pub fn append_log(&mut self, line: &str) {
        self.logs.push_str(line);
        self.logs.push('\n');
    }

    fn rejected(&self, to: ExecutionStatus) -> TransitionError {
        TransitionError {
            id: self.id,
            from: self.status,
            to,
        }
    }
}
