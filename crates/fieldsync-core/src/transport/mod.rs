//! Wire types and the transport seam to the central authority.
//!
//! The engine only sees [`Transport`]; the remote answers a batch with one
//! [`OperationOutcome`] per operation. Any [`TransportError`] fails the whole
//! batch and is always retryable.

mod http;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::VectorClock;
use crate::models::{ConflictType, CrdtOperation, OperationId, Priority, RemoteOperation};

pub use http::HttpTransport;

/// Failure of a whole batch transmission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("transmission timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("invalid response from remote: {0}")]
    InvalidResponse(String),
}

/// One operation as transmitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundOperation {
    pub operation: CrdtOperation,
    pub priority: Priority,
    /// 1 for the first transmission
    pub attempt: u32,
}

/// Remote description of a conflict on one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConflict {
    pub conflict_type: ConflictType,
    #[serde(default)]
    pub remote: Option<RemoteOperation>,
    /// Id of the remote record a duplicate create maps onto
    #[serde(default)]
    pub canonical_id: Option<String>,
}

/// Per-operation result returned by the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub operation_id: OperationId,
    pub accepted: bool,
    #[serde(default)]
    pub remote_vector_clock: Option<VectorClock>,
    #[serde(default)]
    pub conflict: Option<RemoteConflict>,
    #[serde(default)]
    pub error: Option<String>,
}

impl OperationOutcome {
    pub const fn accepted(
        operation_id: OperationId,
        remote_vector_clock: Option<VectorClock>,
    ) -> Self {
        Self {
            operation_id,
            accepted: true,
            remote_vector_clock,
            conflict: None,
            error: None,
        }
    }

    /// Validation rejection without a conflict
    pub fn rejected(operation_id: OperationId, error: impl Into<String>) -> Self {
        Self {
            operation_id,
            accepted: false,
            remote_vector_clock: None,
            conflict: None,
            error: Some(error.into()),
        }
    }

    pub fn conflict(operation_id: OperationId, conflict: RemoteConflict) -> Self {
        let remote_vector_clock = conflict
            .remote
            .as_ref()
            .map(|remote| remote.vector_clock.clone());
        Self {
            operation_id,
            accepted: false,
            remote_vector_clock,
            conflict: Some(conflict),
            error: None,
        }
    }
}

/// Remote response to one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    #[serde(default)]
    pub outcomes: Vec<OperationOutcome>,
}

impl BatchResult {
    pub const fn new(outcomes: Vec<OperationOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn outcome(&self, operation_id: OperationId) -> Option<&OperationOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.operation_id == operation_id)
    }
}

/// Batch delivery to the central authority (async)
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn send(&self, batch: &[OutboundOperation]) -> Result<BatchResult, TransportError>;
}
