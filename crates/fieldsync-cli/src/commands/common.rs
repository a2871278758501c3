use std::collections::BTreeSet;
use std::io::{self, IsTerminal, Read};
use std::sync::Arc;

use chrono::Utc;
use fieldsync_core::models::{new_entity_id, FailedOperation};
use fieldsync_core::{
    ConflictResolution, HttpTransport, LibSqlStore, LocalEffect, OfflineState, OperationId,
    OperationType, QueuedOperation, SyncEngine, SyncStatus, SystemClock,
};
use serde_json::Value;

use crate::config::{non_blank, Settings};
use crate::error::CliError;
use crate::transport::CliTransport;

pub type CliEngine = SyncEngine<LibSqlStore, CliTransport>;

pub async fn open_engine(settings: &Settings) -> Result<CliEngine, CliError> {
    let store = LibSqlStore::open_path(settings.db_path.clone()).await?;

    let transport = match settings.remote_url.as_deref() {
        Some(url) => {
            let http = HttpTransport::new(url, settings.auth_token.clone())?;
            tracing::debug!("Remote sync endpoint: {}", http.endpoint());
            CliTransport::Http(http)
        }
        None => CliTransport::Unconfigured,
    };

    Ok(SyncEngine::open(store, transport, Arc::new(SystemClock), settings.engine.clone()).await?)
}

pub const fn require_remote(settings: &Settings) -> Result<(), CliError> {
    if settings.remote_url.is_none() {
        return Err(CliError::SyncNotConfigured);
    }
    Ok(())
}

pub fn resolve_entity_id(
    op_type: OperationType,
    entity_id: Option<String>,
) -> Result<String, CliError> {
    match non_blank(entity_id) {
        Some(entity_id) => Ok(entity_id),
        None if op_type == OperationType::Create => Ok(new_entity_id()),
        None => Err(CliError::MissingEntityId(op_type.to_string())),
    }
}

/// Payload for an operation; deletes carry none, creates and updates
/// default to an empty object
pub fn parse_operation_data(op_type: OperationType, raw: Option<&str>) -> Result<Value, CliError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(match op_type {
            OperationType::Delete => Value::Null,
            OperationType::Create | OperationType::Update => Value::Object(serde_json::Map::new()),
        });
    };

    let data: Value =
        serde_json::from_str(raw).map_err(|error| CliError::InvalidData(error.to_string()))?;
    if op_type != OperationType::Delete && !data.is_object() {
        return Err(CliError::InvalidData(format!(
            "{op_type} payload must be a JSON object"
        )));
    }
    Ok(data)
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(non_blank(Some(buffer)))
}

pub fn normalize_operation_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyOperationId)
    } else {
        Ok(trimmed.to_ascii_lowercase())
    }
}

/// Resolve a full id or a unique prefix against `candidates`
pub fn match_operation_id<I>(query: &str, candidates: I) -> Result<OperationId, CliError>
where
    I: IntoIterator<Item = OperationId>,
{
    let query = normalize_operation_identifier(query)?;
    let candidates: BTreeSet<OperationId> = candidates.into_iter().collect();

    if let Ok(id) = query.parse::<OperationId>() {
        if candidates.contains(&id) {
            return Ok(id);
        }
    }

    let matching: Vec<OperationId> = candidates
        .into_iter()
        .filter(|id| id.to_string().starts_with(&query))
        .collect();

    match matching.as_slice() {
        [] => Err(CliError::OperationNotFound(query)),
        [id] => Ok(*id),
        _ => {
            let options = matching
                .iter()
                .take(3)
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousOperationId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

pub fn format_status_lines(state: &OfflineState, now_ms: i64) -> Vec<String> {
    let last_sync = state.last_sync.map_or_else(
        || "never".to_string(),
        |at| format!("{} ({})", format_timestamp(at), format_relative_time(at, now_ms)),
    );
    vec![
        format!("Device:      {}", state.device_id),
        format!(
            "Connection:  {}",
            if state.is_online { "online" } else { "offline" }
        ),
        format!("Last sync:   {last_sync}"),
        format!("Pending:     {}", state.pending_operations),
        format!("Failed:      {}", state.failed_operations.len()),
        format!("Conflicts:   {} open", state.open_conflicts().count()),
    ]
}

pub fn format_pending_lines(operations: &[QueuedOperation], now_ms: i64) -> Vec<String> {
    operations
        .iter()
        .map(|queued| {
            let operation = &queued.operation;
            let event = &queued.event;
            let line = format!(
                "{}  {:<7}  {:<8}  {:<6}  {}/{}  v{}  {}",
                operation.id,
                event.status.as_str(),
                event.priority.as_str(),
                operation.op_type.as_str(),
                operation.entity,
                operation.entity_id,
                operation.version,
                format_relative_time(operation.timestamp, now_ms)
            );
            match (&event.error, event.status) {
                (Some(error), SyncStatus::Failed) => {
                    format!("{line}  retry {}: {error}", event.retry_count)
                }
                _ => line,
            }
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[ConflictResolution]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<17}  {:<11}  {}/{}  local=v{} remote=v{}  {}",
                conflict.operation_id,
                conflict.conflict_type.as_str(),
                conflict.resolution.as_str(),
                conflict.entity,
                conflict.entity_id,
                conflict.local_version,
                conflict.remote_version,
                format_timestamp(conflict.detected_at)
            )
        })
        .collect()
}

pub fn format_failed_lines(failed: &[FailedOperation]) -> Vec<String> {
    failed
        .iter()
        .map(|operation| {
            format!(
                "{}  {:<6}  {}/{}  retries={}  {}",
                operation.operation_id,
                operation.op_type.as_str(),
                operation.entity,
                operation.entity_id,
                operation.retry_count,
                operation.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect()
}

pub fn describe_effect(effect: &LocalEffect) -> String {
    match effect {
        LocalEffect::RemoveRecord { entity, entity_id } => {
            format!("Remote removed {entity}/{entity_id}")
        }
        LocalEffect::ApplyRemote {
            entity,
            entity_id,
            data,
        } => format!("Remote data for {entity}/{entity_id}: {data}"),
        LocalEffect::RemapId { entity, from, to } => {
            format!("{entity}/{from} is now {entity}/{to}")
        }
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
