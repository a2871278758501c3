use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fieldsync_core::{OperationType, Priority, Resolution};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Record field operations offline and sync them when a link is available")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the CLI config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Sync authority base URL (overrides FIELDSYNC_REMOTE_URL and config)
    #[arg(long, global = true, value_name = "URL")]
    pub remote_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a local mutation
    Add {
        /// Operation type: create, update or delete
        op: OperationType,
        /// Entity name, e.g. `inspections`
        entity: String,
        /// Record id (generated for creates when omitted)
        entity_id: Option<String>,
        /// JSON object payload (read from stdin when piped)
        #[arg(short, long, value_name = "JSON")]
        data: Option<String>,
        /// low, medium, high or critical
        #[arg(short, long, default_value = "medium")]
        priority: Priority,
    },
    /// Show sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List unconfirmed operations
    Pending {
        /// Number of operations to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one sync cycle now
    Sync {
        /// Output the cycle report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep syncing on the configured interval until interrupted
    Watch,
    /// List sync conflicts awaiting resolution
    Conflicts {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a held conflict
    Resolve {
        /// Operation ID or unique ID prefix
        id: String,
        /// local, remote or merge
        resolution: Resolution,
    },
    /// List permanently failed operations
    Failed {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Queue a failed operation again with a fresh retry budget
    Retry {
        /// Operation ID or unique ID prefix
        id: String,
    },
    /// Discard a permanently failed operation
    Dismiss {
        /// Operation ID or unique ID prefix
        id: String,
    },
    /// Print this device's id
    Device,
}
