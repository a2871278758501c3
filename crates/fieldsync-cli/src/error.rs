use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] fieldsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid operation data: {0}")]
    InvalidData(String),
    #[error("An entity id is required for {0} operations")]
    MissingEntityId(String),
    #[error("Operation ID cannot be empty")]
    EmptyOperationId,
    #[error("No matching operation for id/prefix: {0}")]
    OperationNotFound(String),
    #[error("{0}")]
    AmbiguousOperationId(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Sync did not complete: {0}")]
    SyncIncomplete(String),
    #[error(
        "Sync is not configured. Set FIELDSYNC_REMOTE_URL, pass --remote-url, or add `remoteUrl` to the config file."
    )]
    SyncNotConfigured,
}
