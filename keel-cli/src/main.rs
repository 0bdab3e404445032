//! Keel CLI
//!
//! Triggers pipeline executions, follows their live progress and inspects
//! the execution history.

mod commands;
mod id_resolver;
mod store;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Keel CI/CD pipeline engine", long_about = None)]
struct Cli {
    /// PostgreSQL URL; executions are kept in memory when unset
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Settings shared by every command
pub struct Settings {
    pub database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel=info,keel_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = Settings {
        database_url: cli.database_url,
    };

    handle_command(cli.command, &settings).await
}
