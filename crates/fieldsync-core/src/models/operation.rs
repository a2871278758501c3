//! CRDT operation model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::clock::VectorClock;

/// A unique identifier for an operation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new unique operation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Stable identifier of the originating device.
///
/// Generated once at first run and persisted with the device metadata.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap an existing device identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh collision-resistant device identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generate a collision-resistant id for a locally created record.
///
/// Used for `create` operations, since the remote id may not exist yet.
#[must_use]
pub fn new_entity_id() -> String {
    Uuid::now_v7().to_string()
}

/// Kind of mutation an operation records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown operation type '{other}'")),
        }
    }
}

/// A record within an entity collection, e.g. `products/p1`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.entity_id)
    }
}

/// An immutable record of one local mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtOperation {
    /// Unique identifier, never reused
    pub id: OperationId,
    /// Kind of mutation
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Logical collection name (e.g. "products")
    pub entity: String,
    /// Record identifier within the collection, stable across devices
    pub entity_id: String,
    /// Full record for create, partial field set for update, ignored for delete
    pub data: serde_json::Value,
    /// Device-local wall clock (Unix ms); tie-break and display only
    pub timestamp: i64,
    /// Originating device
    pub device_id: DeviceId,
    /// Device operation counter at creation time
    pub version: u64,
    /// Causal history observed when the operation was created
    pub vector_clock: VectorClock,
    /// Caller-supplied business key used to detect duplicate creates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
}

impl CrdtOperation {
    /// The record this operation targets
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity.clone(), self.entity_id.clone())
    }

    /// Whether this operation targets `entity`
    pub fn targets(&self, entity: &EntityRef) -> bool {
        self.entity == entity.entity && self.entity_id == entity.entity_id
    }
}
