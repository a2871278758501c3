//! Sync queue entry model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::OperationId;

/// Business importance assigned by the caller
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Delivery status of a queued operation.
///
/// Moves `pending -> syncing -> {synced | failed}`; `failed` returns to
/// `pending` only through a backoff-scheduled requeue or an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn default_retryable() -> bool {
    true
}

/// Delivery bookkeeping for one operation, referenced by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub operation_id: OperationId,
    pub status: SyncStatus,
    pub priority: Priority,
    /// Number of backoff-scheduled retries performed so far
    #[serde(default)]
    pub retry_count: u32,
    /// Time of the last failed attempt (Unix ms)
    #[serde(default)]
    pub last_retry: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    /// False when the remote rejected the payload itself
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    /// Number of times this operation was placed in a batch
    #[serde(default)]
    pub attempts: u32,
    /// When the event entered `syncing` (Unix ms)
    #[serde(default)]
    pub syncing_since: Option<i64>,
}

impl SyncEvent {
    /// Fresh pending event for a newly appended operation
    pub const fn new(operation_id: OperationId, priority: Priority) -> Self {
        Self {
            operation_id,
            status: SyncStatus::Pending,
            priority,
            retry_count: 0,
            last_retry: None,
            error: None,
            retryable: true,
            attempts: 0,
            syncing_since: None,
        }
    }

    /// Failed for good: not retryable, or out of retries
    pub const fn is_exhausted(&self, max_retries: u32) -> bool {
        matches!(self.status, SyncStatus::Failed)
            && (!self.retryable || self.retry_count >= max_retries)
    }

    /// Never been placed in a batch
    pub const fn is_untransmitted(&self) -> bool {
        matches!(self.status, SyncStatus::Pending) && self.attempts == 0
    }
}
