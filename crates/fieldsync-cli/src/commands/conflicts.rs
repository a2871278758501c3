use fieldsync_core::Resolution;

use crate::commands::common::{format_conflict_lines, match_operation_id, open_engine};
use crate::config::Settings;
use crate::error::CliError;

pub async fn run_conflicts(settings: &Settings, all: bool, as_json: bool) -> Result<(), CliError> {
    let engine = open_engine(settings).await?;
    let conflicts: Vec<_> = engine
        .conflicts()
        .await
        .into_iter()
        .filter(|conflict| all || conflict.is_blocking())
        .collect();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!(
            "{}",
            if all {
                "No sync conflicts recorded."
            } else {
                "No conflicts awaiting resolution."
            }
        );
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve(
    settings: &Settings,
    id: &str,
    resolution: Resolution,
) -> Result<(), CliError> {
    let engine = open_engine(settings).await?;
    let open = engine
        .conflicts()
        .await
        .into_iter()
        .filter(|conflict| conflict.is_blocking())
        .map(|conflict| conflict.operation_id);
    let operation_id = match_operation_id(id, open)?;

    engine
        .resolve_conflict_manually(operation_id, resolution)
        .await?;
    println!("Resolved {operation_id} as {resolution}");
    if settings.remote_url.is_some() {
        println!("Run `fieldsync sync` to push the result.");
    }
    Ok(())
}
