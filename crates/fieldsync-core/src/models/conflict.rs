//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{EntityRef, OperationId, OperationType};
use crate::clock::VectorClock;

/// How a local operation collided with remote state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides updated the same record concurrently
    ConcurrentUpdate,
    /// The record was deleted remotely while updated locally
    DeleteUpdate,
    /// Two devices created the same logical record independently
    CreateDuplicate,
}

impl ConflictType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConcurrentUpdate => "concurrent_update",
            Self::DeleteUpdate => "delete_update",
            Self::CreateDuplicate => "create_duplicate",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome applied to a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    Merge,
    /// Waiting for the application or user to decide
    Manual,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "local" | "local_wins" => Ok(Self::LocalWins),
            "remote" | "remote_wins" => Ok(Self::RemoteWins),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown resolution '{other}'")),
        }
    }
}

/// The remote side of a conflict, as reported by the authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOperation {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub op_type: Option<OperationType>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub version: u64,
    /// Remote device wall clock (Unix ms)
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub vector_clock: VectorClock,
}

/// Recorded sync conflict and how it was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    /// Local operation involved in the conflict
    pub operation_id: OperationId,
    pub entity: String,
    pub entity_id: String,
    pub conflict_type: ConflictType,
    pub local_version: u64,
    pub remote_version: u64,
    pub resolution: Resolution,
    /// Resolution timestamp (Unix ms); `None` while a manual conflict is open
    #[serde(default)]
    pub resolved_at: Option<i64>,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    /// Remote state the local operation collided with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteOperation>,
}

impl ConflictResolution {
    /// Open manual conflicts hold every later operation on the entity
    pub const fn is_blocking(&self) -> bool {
        matches!(self.resolution, Resolution::Manual) && self.resolved_at.is_none()
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity.clone(), self.entity_id.clone())
    }
}
