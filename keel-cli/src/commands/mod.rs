//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod execution;
mod run;

use anyhow::{Result, bail};
use clap::Subcommand;
use colored::*;

use crate::Settings;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline for a repository and follow its progress
    Run {
        /// Git repository URL
        #[arg(long)]
        repo: String,

        /// Branch to build
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// Show one execution with its full log
    Show {
        /// Execution ID or unambiguous prefix
        id: String,

        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },
    /// List executions, newest first
    List,
    /// Create or update the database schema
    Migrate,
}

/// Handle a CLI command
pub async fn handle_command(command: Commands, settings: &Settings) -> Result<()> {
    match command {
        Commands::Run { repo, branch } => run::handle_run(&repo, &branch, settings).await,
        Commands::Show { id, json } => execution::show_execution(&id, json, settings).await,
        Commands::List => execution::list_executions(settings).await,
        Commands::Migrate => migrate(settings).await,
    }
}

async fn migrate(settings: &Settings) -> Result<()> {
    let Some(url) = &settings.database_url else {
        bail!("DATABASE_URL or --database-url is required for migrate");
    };

    // Connecting runs the migrations.
    crate::store::connect_with_retry(url).await?;
    println!("{}", "✓ Database schema is up to date".green());
    Ok(())
}
