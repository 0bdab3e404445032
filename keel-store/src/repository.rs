//! Execution Repository
//!
//! Handles all database operations related to executions.

use keel_core::domain::execution::{Execution, ExecutionStatus};
use keel_core::domain::source::SourceRef;
use sqlx::PgPool;
use uuid::Uuid;

/// Insert a new PENDING execution
pub async fn create(pool: &PgPool, source: SourceRef) -> Result<Execution, sqlx::Error> {
    let execution = Execution::new(source);

    sqlx::query(
        r#"
        INSERT INTO executions (id, repo_url, branch, status, created_at, logs)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(execution.id)
    .bind(&execution.source.repo_url)
    .bind(&execution.source.branch)
    .bind(status_to_string(execution.status))
    .bind(execution.created_at)
    .bind(&execution.logs)
    .execute(pool)
    .await?;

    Ok(execution)
}

/// Find an execution by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Execution>, sqlx::Error> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, repo_url, branch, status, created_at, start_time, end_time, logs
        FROM executions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Write the whole record, inserting it if it does not exist yet
pub async fn save(pool: &PgPool, execution: &Execution) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO executions (id, repo_url, branch, status, created_at, start_time, end_time, logs)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            start_time = EXCLUDED.start_time,
            end_time = EXCLUDED.end_time,
            logs = EXCLUDED.logs
        "#,
    )
    .bind(execution.id)
    .bind(&execution.source.repo_url)
    .bind(&execution.source.branch)
    .bind(status_to_string(execution.status))
    .bind(execution.created_at)
    .bind(execution.start_time)
    .bind(execution.end_time)
    .bind(&execution.logs)
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent successful execution of a repository, by start time
pub async fn find_latest_success(
    pool: &PgPool,
    repo_url: &str,
) -> Result<Option<Execution>, sqlx::Error> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, repo_url, branch, status, created_at, start_time, end_time, logs
        FROM executions
        WHERE repo_url = $1 AND status = $2
        ORDER BY start_time DESC NULLS LAST
        LIMIT 1
        "#,
    )
    .bind(repo_url)
    .bind(status_to_string(ExecutionStatus::Success))
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// List all executions, newest first
pub async fn list_all(pool: &PgPool) -> Result<Vec<Execution>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, repo_url, branch, status, created_at, start_time, end_time, logs
        FROM executions
        ORDER BY created_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_to_string(status: ExecutionStatus) -> &'static str {
    status.as_str()
}

fn string_to_status(s: &str) -> ExecutionStatus {
    s.parse().unwrap_or_else(|e| {
        tracing::warn!("{}; treating as PENDING", e);
        ExecutionStatus::Pending
    })
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    repo_url: String,
    branch: String,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
    start_time: Option<chrono::DateTime<chrono::Utc>>,
    end_time: Option<chrono::DateTime<chrono::Utc>>,
    logs: String,
}

impl From<ExecutionRow> for Execution {
    fn from(row: ExecutionRow) -> Self {
        Execution {
            id: row.id,
            source: SourceRef::new(row.repo_url, row.branch),
            status: string_to_status(&row.status),
            created_at: row.created_at,
            start_time: row.start_time,
            end_time: row.end_time,
            logs: row.logs,
        }
    }
}
