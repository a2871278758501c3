use fieldsync_core::{CycleReport, CycleStatus, Scheduler, SyncStatus};

use crate::commands::common::{
    describe_effect, format_timestamp, open_engine, require_remote, CliEngine,
};
use crate::config::Settings;
use crate::error::CliError;

pub async fn run_sync(settings: &Settings, as_json: bool) -> Result<(), CliError> {
    require_remote(settings)?;
    let engine = open_engine(settings).await?;
    let _effects = engine.subscribe_effects(|effect| println!("{}", describe_effect(effect)));

    let report = engine.trigger_sync().await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if report.status == CycleStatus::Completed {
        if !as_json {
            println!("{}", summarize_report(&report));
        }
        return Ok(());
    }
    Err(CliError::SyncIncomplete(
        describe_incomplete(&engine, report.status).await,
    ))
}

pub fn summarize_report(report: &CycleReport) -> String {
    if report.batches == 0 {
        return "Nothing to sync".to_string();
    }
    let mut summary = format!(
        "Sync completed: {} synced, {} conflicts, {} failed",
        report.synced, report.conflicts, report.failed
    );
    if report.discarded > 0 {
        summary.push_str(&format!(", {} discarded", report.discarded));
    }
    summary
}

async fn describe_incomplete(engine: &CliEngine, status: CycleStatus) -> String {
    match status {
        CycleStatus::TransportFailed => {
            let reason = engine
                .pending_operations()
                .await
                .into_iter()
                .find(|queued| queued.event.status == SyncStatus::Failed)
                .and_then(|queued| queued.event.error)
                .unwrap_or_else(|| "transmission failed".to_string());
            format!("{reason}; operations will be retried")
        }
        CycleStatus::Offline => "device is offline".to_string(),
        CycleStatus::Abandoned => "connectivity lost during transmission".to_string(),
        CycleStatus::Coalesced => "another sync is already running".to_string(),
        CycleStatus::Deferred => "waiting for the retry backoff to elapse".to_string(),
        CycleStatus::Completed => "completed".to_string(),
    }
}

pub async fn run_watch(settings: &Settings) -> Result<(), CliError> {
    require_remote(settings)?;
    let engine = open_engine(settings).await?;

    let _state = engine.subscribe(|state| {
        if state.sync_in_progress {
            return;
        }
        let last_sync = state
            .last_sync
            .map_or_else(|| "never".to_string(), format_timestamp);
        println!(
            "pending={} failed={} conflicts={} last_sync={last_sync}",
            state.pending_operations,
            state.failed_operations.len(),
            state.open_conflicts().count()
        );
    });
    let _effects = engine.subscribe_effects(|effect| println!("{}", describe_effect(effect)));

    if engine.config().sync_interval().is_none() {
        tracing::warn!("Periodic sync is disabled; syncing once and on connectivity changes");
    }
    println!("Watching for changes; press Ctrl-C to stop");

    engine.request_sync();
    Scheduler::new(engine.clone())
        .run(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await;
    Ok(())
}
