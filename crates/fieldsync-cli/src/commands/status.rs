use crate::commands::common::{format_status_lines, now_ms, open_engine};
use crate::config::Settings;
use crate::error::CliError;

pub async fn run_status(settings: &Settings, as_json: bool) -> Result<(), CliError> {
    let engine = open_engine(settings).await?;
    let state = engine.state();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    for line in format_status_lines(&state, now_ms()) {
        println!("{line}");
    }
    if settings.remote_url.is_none() {
        println!("Remote:      not configured");
    }
    Ok(())
}

pub async fn run_device(settings: &Settings) -> Result<(), CliError> {
    let engine = open_engine(settings).await?;
    println!("{}", engine.device_id());
    Ok(())
}
