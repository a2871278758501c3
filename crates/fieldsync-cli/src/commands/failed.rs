use crate::commands::common::{format_failed_lines, match_operation_id, open_engine};
use crate::config::Settings;
use crate::error::CliError;

pub async fn run_failed(settings: &Settings, as_json: bool) -> Result<(), CliError> {
    let engine = open_engine(settings).await?;
    let failed = engine.state().failed_operations;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&failed)?);
        return Ok(());
    }

    if failed.is_empty() {
        println!("No failed operations.");
        return Ok(());
    }

    for line in format_failed_lines(&failed) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_retry(settings: &Settings, id: &str) -> Result<(), CliError> {
    let engine = open_engine(settings).await?;
    let failed = engine
        .pending_operations()
        .await
        .into_iter()
        .filter(|queued| queued.event.status == fieldsync_core::SyncStatus::Failed)
        .map(|queued| queued.operation.id);
    let operation_id = match_operation_id(id, failed)?;

    engine.retry_failed(operation_id).await?;
    println!("{operation_id}");
    Ok(())
}

pub async fn run_dismiss(settings: &Settings, id: &str) -> Result<(), CliError> {
    let engine = open_engine(settings).await?;
    let failed = engine
        .state()
        .failed_operations
        .into_iter()
        .map(|operation| operation.operation_id);
    let operation_id = match_operation_id(id, failed)?;

    engine.dismiss_failed(operation_id).await?;
    println!("{operation_id}");
    Ok(())
}
