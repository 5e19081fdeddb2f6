//! # Courier Main Entry Point
//!
//! `serve` runs the API and the delivery worker pool; `migrate` applies
//! database migrations and exits.

use clap::{Parser, Subcommand};
use courier::{
    config::ConfigLoader,
    db::{init_pool, migrate},
    server::run_server,
    telemetry,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "Webhook delivery engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the API server and delivery workers (default)
    Serve {
        /// Apply pending migrations before starting
        #[arg(long)]
        migrate: bool,
    },
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load()?;
    telemetry::init_tracing(&config)?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = init_pool(&config).await?;

    match cli.command.unwrap_or(Command::Serve { migrate: false }) {
        Command::Migrate => {
            migrate(&db).await?;
            info!("Migrations applied");
            Ok(())
        }
        Command::Serve { migrate: run_migrations } => {
            if run_migrations {
                migrate(&db).await?;
            }
            run_server(config, db).await
        }
    }
}
