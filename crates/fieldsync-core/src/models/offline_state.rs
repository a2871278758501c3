//! Externally observed sync state

use serde::{Deserialize, Serialize};

use super::{ConflictResolution, DeviceId, OperationId, OperationType};

/// A permanently failed operation awaiting user action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedOperation {
    pub operation_id: OperationId,
    pub op_type: OperationType,
    pub entity: String,
    pub entity_id: String,
    pub error: Option<String>,
    pub retry_count: u32,
    pub last_retry: Option<i64>,
}

/// Immutable snapshot of the engine, published to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineState {
    pub is_online: bool,
    /// Last completed sync cycle (Unix ms)
    pub last_sync: Option<i64>,
    /// Unconfirmed operations still headed for the remote
    pub pending_operations: usize,
    pub failed_operations: Vec<FailedOperation>,
    pub conflict_resolution: Vec<ConflictResolution>,
    pub sync_in_progress: bool,
    pub device_id: DeviceId,
}

impl OfflineState {
    /// Open manual conflicts
    pub fn open_conflicts(&self) -> impl Iterator<Item = &ConflictResolution> {
        self.conflict_resolution
            .iter()
            .filter(|conflict| conflict.is_blocking())
    }
}
