//! fieldsync CLI - record field operations offline, sync them when online

mod cli;
mod commands;
mod config;
mod error;
mod transport;


use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::add::run_add;
use crate::commands::conflicts::{run_conflicts, run_resolve};
use crate::commands::failed::{run_dismiss, run_failed, run_retry};
use crate::commands::pending::run_pending;
use crate::commands::status::{run_device, run_status};
use crate::commands::sync::{run_sync, run_watch};
use crate::config::Settings;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fieldsync=info,fieldsync_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::resolve(cli.db_path, cli.config, cli.remote_url)?;

    match cli.command {
        Commands::Add {
            op,
            entity,
            entity_id,
            data,
            priority,
        } => run_add(&settings, op, &entity, entity_id, data, priority).await?,
        Commands::Status { json } => run_status(&settings, json).await?,
        Commands::Pending { limit, json } => run_pending(&settings, limit, json).await?,
        Commands::Sync { json } => run_sync(&settings, json).await?,
        Commands::Watch => run_watch(&settings).await?,
        Commands::Conflicts { all, json } => run_conflicts(&settings, all, json).await?,
        Commands::Resolve { id, resolution } => run_resolve(&settings, &id, resolution).await?,
        Commands::Failed { json } => run_failed(&settings, json).await?,
        Commands::Retry { id } => run_retry(&settings, &id).await?,
        Commands::Dismiss { id } => run_dismiss(&settings, &id).await?,
        Commands::Device => run_device(&settings).await?,
    }

    Ok(())
}
