use crate::commands::common::{format_pending_lines, now_ms, open_engine};
use crate::config::Settings;
use crate::error::CliError;

pub async fn run_pending(settings: &Settings, limit: usize, as_json: bool) -> Result<(), CliError> {
    let engine = open_engine(settings).await?;
    let mut operations = engine.pending_operations().await;
    operations.truncate(limit);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&operations)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("No pending operations.");
        return Ok(());
    }

    for line in format_pending_lines(&operations, now_ms()) {
        println!("{line}");
    }
    Ok(())
}
