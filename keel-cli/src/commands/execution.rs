//! Execution history commands

use anyhow::{Result, anyhow};
use colored::*;
use keel_core::domain::execution::{Execution, ExecutionStatus};
use keel_engine::store::ExecutionStore;

use crate::Settings;
use crate::id_resolver::resolve_execution_id;

/// List all executions
pub async fn list_executions(settings: &Settings) -> Result<()> {
    let store = crate::store::open(settings).await?;
    let executions = store.list().await?;

    if executions.is_empty() {
        println!("{}", "No executions found.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} execution(s):", executions.len()).bold()
        );
        println!();
        for execution in &executions {
            print_execution_summary(execution);
        }
    }

    Ok(())
}

/// Show a single execution with its log
pub async fn show_execution(id: &str, json: bool, settings: &Settings) -> Result<()> {
    let store = crate::store::open(settings).await?;
    let uuid = resolve_execution_id(store.as_ref(), id).await?;
    let execution = store
        .get(uuid)
        .await?
        .ok_or_else(|| anyhow!("Execution {} not found", uuid))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    print_execution_details(&execution);
    if execution.logs.is_empty() {
        println!("\n{}", "No logs recorded for this execution.".yellow());
    } else {
        println!("\n{}", "Logs:".bold());
        println!("{}", "─".repeat(80).dimmed());
        for line in execution.logs.lines() {
            print_log_line(line);
        }
        println!("{}", "─".repeat(80).dimmed());
    }

    Ok(())
}

fn print_execution_summary(execution: &Execution) {
    println!(
        "  {} Execution {}",
        "▸".cyan(),
        execution.id.to_string().dimmed()
    );
    println!("    Source:   {}", execution.source);
    println!("    Status:   {}", colorize_status(execution.status));
    println!(
        "    Created:  {}",
        execution
            .created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

pub fn print_execution_details(execution: &Execution) {
    println!("{}", "Execution Details:".bold());
    println!("  ID:          {}", execution.id.to_string().cyan());
    println!("  Repository:  {}", execution.source.repo_url);
    println!("  Branch:      {}", execution.source.branch);
    println!("  Status:      {}", colorize_status(execution.status));
    println!(
        "  Created:     {}",
        execution.created_at.format("%Y-%m-%d %H:%M:%S")
    );

    if let Some(started) = execution.start_time {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(ended) = execution.end_time {
        println!("  Ended:       {}", ended.format("%Y-%m-%d %H:%M:%S"));

        if let Some(started) = execution.start_time {
            let seconds = ended.signed_duration_since(started).num_seconds();
            println!("  Duration:    {}s", seconds);
        }
    }
}

/// Print one log line, highlighting stage banners and problems
pub fn print_log_line(line: &str) {
    if line.starts_with("--- ") {
        println!("{}", line.bold().cyan());
    } else if line.contains("ERROR") || line.contains("FAILED") || line.starts_with("Rollback failed") {
        println!("{}", line.red());
    } else if line.contains("WARNING") || line.starts_with("[stderr]") {
        println!("{}", line.yellow());
    } else {
        println!("{}", line);
    }
}

/// Colorize execution status for display
pub fn colorize_status(status: ExecutionStatus) -> ColoredString {
    let status_str = status.as_str();
    match status {
        ExecutionStatus::Pending => status_str.yellow(),
        ExecutionStatus::Running => status_str.cyan(),
        ExecutionStatus::Success => status_str.green(),
        ExecutionStatus::Failed => status_str.red(),
    }
}
