//! Local-view changes produced by reconciliation

use serde::{Deserialize, Serialize};

/// A change the application must apply to its local records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalEffect {
    /// Drop the local copy of a record
    RemoveRecord { entity: String, entity_id: String },
    /// Overwrite local fields with the given (possibly partial) record
    ApplyRemote {
        entity: String,
        entity_id: String,
        data: serde_json::Value,
    },
    /// Replace references to a locally created id with the canonical one
    RemapId {
        entity: String,
        from: String,
        to: String,
    },
}
