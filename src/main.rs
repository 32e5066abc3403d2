//! # Collections Sync Entry Point

use anyhow::Context;
use clap::{Parser, Subcommand};
use collections_sync::{
    config::ConfigLoader,
    db::{health_check, init_pool, run_migrations},
    server::run_server,
    telemetry::init_tracing,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(version, about = "QuickBooks invoice sync service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Default)]
enum Command {
    /// Apply migrations and serve the API (default)
    #[default]
    Serve,
    /// Apply pending migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    init_tracing(&config)?;

    tracing::info!(profile = %config.profile, "Configuration loaded");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Effective configuration");
    }

    let db = init_pool(&config).await?;
    health_check(&db).await?;
    run_migrations(&db).await?;

    match cli.command.unwrap_or_default() {
        Command::Migrate => {
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::Serve => run_server(config, db, CancellationToken::new()).await,
    }
}
