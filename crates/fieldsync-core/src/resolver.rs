//! Conflict classification and the conflict ledger.
//!
//! [`ConflictResolver`] is pure: given a local operation and the remote
//! outcome for it, it returns a [`Decision`] the engine applies to the log.
//! The same inputs always produce the same decision.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::clock::ClockOrdering;
use crate::config::{ConflictStrategy, DeleteUpdateStrategy, EngineConfig};
use crate::error::{Error, Result};
use crate::models::{
    ConflictResolution, ConflictType, CrdtOperation, EntityRef, LocalEffect, OperationId,
    OperationType, RemoteOperation, Resolution,
};
use crate::storage::{get_json, KeyValueStore, WriteBatch};
use crate::transport::OperationOutcome;

pub const CONFLICT_PREFIX: &str = "conflict/";

/// Resolved conflicts kept for display; older ones are pruned
const HISTORY_LIMIT: usize = 200;

fn conflict_key(id: OperationId) -> String {
    format!("{CONFLICT_PREFIX}{id}")
}

/// What the engine must do with a transmitted operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Confirmed by the remote
    Synced,
    /// Remote refused the payload; not retried automatically
    Rejected { error: String },
    /// Remote wins: drop the local operation (or every operation on the
    /// record when `entity_wide`)
    Discard {
        conflict: ConflictResolution,
        effect: Option<LocalEffect>,
        entity_wide: bool,
    },
    /// Replace the local operation by a fresh one carrying `data`
    Rebase {
        conflict: ConflictResolution,
        op_type: OperationType,
        data: Value,
        effect: Option<LocalEffect>,
    },
    /// Park the record until the conflict is resolved by hand
    Hold { conflict: ConflictResolution },
    /// Local create duplicated a remote record; move to `canonical_id`
    Remap {
        conflict: ConflictResolution,
        canonical_id: String,
    },
}

impl Decision {
    pub const fn conflict(&self) -> Option<&ConflictResolution> {
        match self {
            Self::Synced | Self::Rejected { .. } => None,
            Self::Discard { conflict, .. }
            | Self::Rebase { conflict, .. }
            | Self::Hold { conflict }
            | Self::Remap { conflict, .. } => Some(conflict),
        }
    }
}

/// Overlay `local` fields on top of `remote`
pub fn merge_records(remote: &Value, local: &Value) -> Value {
    match (remote, local) {
        (Value::Object(remote_map), Value::Object(local_map)) => {
            let mut merged = remote_map.clone();
            for (key, value) in local_map {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => local.clone(),
    }
}

/// True when both payloads are objects touching no common field
pub fn fields_are_disjoint(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(map_a), Value::Object(map_b)) => {
            !map_a.keys().any(|k| map_b.contains_key(k))
        }
        _ => false,
    }
}

/// Last-writer-wins order on device wall clocks.
///
/// Timestamp first, then device id, then version. Wall clocks drift between
/// devices, so this only decides a winner; it says nothing about causality.
fn local_wins_lww(local: &CrdtOperation, remote: &RemoteOperation) -> bool {
    let order = local
        .timestamp
        .cmp(&remote.timestamp)
        .then_with(|| {
            local
                .device_id
                .as_str()
                .cmp(remote.device_id.as_deref().unwrap_or_default())
        })
        .then(local.version.cmp(&remote.version));
    order != Ordering::Less
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConflictResolver {
    conflict_strategy: ConflictStrategy,
    delete_update_strategy: DeleteUpdateStrategy,
}

impl From<&EngineConfig> for ConflictResolver {
    fn from(config: &EngineConfig) -> Self {
        Self::new(config.conflict_strategy, config.delete_update_strategy)
    }
}

impl ConflictResolver {
    pub const fn new(
        conflict_strategy: ConflictStrategy,
        delete_update_strategy: DeleteUpdateStrategy,
    ) -> Self {
        Self {
            conflict_strategy,
            delete_update_strategy,
        }
    }

    fn record(
        local: &CrdtOperation,
        conflict_type: ConflictType,
        remote: Option<&RemoteOperation>,
        resolution: Resolution,
        now: i64,
    ) -> ConflictResolution {
        ConflictResolution {
            operation_id: local.id,
            entity: local.entity.clone(),
            entity_id: local.entity_id.clone(),
            conflict_type,
            local_version: local.version,
            remote_version: remote.map_or(0, |remote| remote.version),
            resolution,
            resolved_at: (resolution != Resolution::Manual).then_some(now),
            detected_at: now,
            remote: remote.cloned(),
        }
    }

    /// Classify the remote outcome for one transmitted operation
    pub fn classify(
        &self,
        local: &CrdtOperation,
        outcome: &OperationOutcome,
        now: i64,
    ) -> Decision {
        if outcome.accepted {
            return Decision::Synced;
        }
        let Some(conflict) = &outcome.conflict else {
            return Decision::Rejected {
                error: outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "rejected by remote".to_string()),
            };
        };
        let remote = conflict.remote.as_ref();

        match conflict.conflict_type {
            ConflictType::DeleteUpdate => match self.delete_update_strategy {
                DeleteUpdateStrategy::RemoteWins => Decision::Discard {
                    conflict: Self::record(
                        local,
                        ConflictType::DeleteUpdate,
                        remote,
                        Resolution::RemoteWins,
                        now,
                    ),
                    effect: Some(LocalEffect::RemoveRecord {
                        entity: local.entity.clone(),
                        entity_id: local.entity_id.clone(),
                    }),
                    entity_wide: true,
                },
                DeleteUpdateStrategy::Manual => Decision::Hold {
                    conflict: Self::record(
                        local,
                        ConflictType::DeleteUpdate,
                        remote,
                        Resolution::Manual,
                        now,
                    ),
                },
            },
            ConflictType::CreateDuplicate => match &conflict.canonical_id {
                Some(canonical_id) if canonical_id != &local.entity_id => Decision::Remap {
                    conflict: Self::record(
                        local,
                        ConflictType::CreateDuplicate,
                        remote,
                        Resolution::Merge,
                        now,
                    ),
                    canonical_id: canonical_id.clone(),
                },
                _ => Decision::Hold {
                    conflict: Self::record(
                        local,
                        ConflictType::CreateDuplicate,
                        remote,
                        Resolution::Manual,
                        now,
                    ),
                },
            },
            ConflictType::ConcurrentUpdate => self.classify_concurrent(local, remote, now),
        }
    }

    fn classify_concurrent(
        &self,
        local: &CrdtOperation,
        remote: Option<&RemoteOperation>,
        now: i64,
    ) -> Decision {
        let conflict_type = ConflictType::ConcurrentUpdate;
        let Some(remote_op) = remote else {
            return Decision::Hold {
                conflict: Self::record(local, conflict_type, None, Resolution::Manual, now),
            };
        };

        let local_wins = |resolution| Decision::Rebase {
            conflict: Self::record(local, conflict_type, remote, resolution, now),
            op_type: local.op_type,
            data: local.data.clone(),
            effect: None,
        };
        let remote_wins = || Decision::Discard {
            conflict: Self::record(local, conflict_type, remote, Resolution::RemoteWins, now),
            effect: Some(LocalEffect::ApplyRemote {
                entity: local.entity.clone(),
                entity_id: local.entity_id.clone(),
                data: remote_op.data.clone(),
            }),
            entity_wide: false,
        };

        match local.vector_clock.compare(&remote_op.vector_clock) {
            ClockOrdering::Equal => Decision::Synced,
            ClockOrdering::After => local_wins(Resolution::LocalWins),
            ClockOrdering::Before => remote_wins(),
            ClockOrdering::Concurrent if fields_are_disjoint(&local.data, &remote_op.data) => {
                let merged = merge_records(&remote_op.data, &local.data);
                Decision::Rebase {
                    conflict: Self::record(local, conflict_type, remote, Resolution::Merge, now),
                    op_type: local.op_type,
                    data: merged.clone(),
                    effect: Some(LocalEffect::ApplyRemote {
                        entity: local.entity.clone(),
                        entity_id: local.entity_id.clone(),
                        data: merged,
                    }),
                }
            }
            ClockOrdering::Concurrent => match self.conflict_strategy {
                ConflictStrategy::LastWriteWins if local_wins_lww(local, remote_op) => {
                    local_wins(Resolution::LocalWins)
                }
                ConflictStrategy::LastWriteWins => remote_wins(),
                ConflictStrategy::Manual => Decision::Hold {
                    conflict: Self::record(local, conflict_type, remote, Resolution::Manual, now),
                },
            },
        }
    }

    /// Decision for a held conflict once the user picked a resolution
    pub fn resolve_manually(
        &self,
        conflict: &ConflictResolution,
        local: &CrdtOperation,
        resolution: Resolution,
        now: i64,
    ) -> Result<Decision> {
        if !conflict.is_blocking() {
            return Err(Error::InvalidInput(format!(
                "conflict on operation {} is already resolved",
                conflict.operation_id
            )));
        }

        let mut resolved = conflict.clone();
        resolved.resolution = resolution;
        resolved.resolved_at = Some(now);

        let remote_data = conflict
            .remote
            .as_ref()
            .map_or(Value::Null, |remote| remote.data.clone());
        let deleted_remotely = conflict.conflict_type == ConflictType::DeleteUpdate;
        // A record deleted remotely can only come back as a create
        let op_type = if deleted_remotely {
            OperationType::Create
        } else {
            local.op_type
        };

        match resolution {
            Resolution::Manual => Err(Error::InvalidInput(
                "resolution must be local_wins, remote_wins or merge".to_string(),
            )),
            Resolution::LocalWins => Ok(Decision::Rebase {
                conflict: resolved,
                op_type,
                data: if deleted_remotely {
                    merge_records(&remote_data, &local.data)
                } else {
                    local.data.clone()
                },
                effect: None,
            }),
            Resolution::Merge => {
                let merged = merge_records(&remote_data, &local.data);
                Ok(Decision::Rebase {
                    conflict: resolved,
                    op_type,
                    data: merged.clone(),
                    effect: Some(LocalEffect::ApplyRemote {
                        entity: local.entity.clone(),
                        entity_id: local.entity_id.clone(),
                        data: merged,
                    }),
                })
            }
            Resolution::RemoteWins => {
                let effect = if deleted_remotely || conflict.remote.is_none() {
                    LocalEffect::RemoveRecord {
                        entity: local.entity.clone(),
                        entity_id: local.entity_id.clone(),
                    }
                } else {
                    LocalEffect::ApplyRemote {
                        entity: local.entity.clone(),
                        entity_id: local.entity_id.clone(),
                        data: remote_data,
                    }
                };
                Ok(Decision::Discard {
                    conflict: resolved,
                    effect: Some(effect),
                    entity_wide: deleted_remotely,
                })
            }
        }
    }
}

/// Persisted conflicts, open and resolved
#[derive(Debug, Clone, Default)]
pub struct ConflictLedger {
    conflicts: BTreeMap<OperationId, ConflictResolution>,
}

impl ConflictLedger {
    pub async fn load<S: KeyValueStore>(store: &S) -> Result<Self> {
        let mut conflicts = BTreeMap::new();
        for key in store.keys_with_prefix(CONFLICT_PREFIX).await? {
            if let Some(conflict) = get_json::<_, ConflictResolution>(store, &key).await? {
                conflicts.insert(conflict.operation_id, conflict);
            }
        }
        Ok(Self { conflicts })
    }

    /// Insert or replace a conflict, pruning old resolved history
    pub async fn record<S: KeyValueStore>(
        &mut self,
        store: &S,
        conflict: ConflictResolution,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put_json(conflict_key(conflict.operation_id), &conflict)?;

        let mut resolved: Vec<(i64, OperationId)> = self
            .conflicts
            .values()
            .filter(|existing| {
                existing.operation_id != conflict.operation_id && !existing.is_blocking()
            })
            .map(|existing| (existing.detected_at, existing.operation_id))
            .collect();
        if !conflict.is_blocking() {
            resolved.push((conflict.detected_at, conflict.operation_id));
        }
        resolved.sort_unstable();
        let excess = resolved.len().saturating_sub(HISTORY_LIMIT);
        let pruned: Vec<OperationId> = resolved
            .into_iter()
            .take(excess)
            .map(|(_, id)| id)
            .collect();
        for id in &pruned {
            batch.delete(conflict_key(*id));
        }

        store.write_batch(batch).await?;
        for id in &pruned {
            self.conflicts.remove(id);
        }
        if !pruned.contains(&conflict.operation_id) {
            self.conflicts.insert(conflict.operation_id, conflict);
        }
        Ok(())
    }

    pub fn get(&self, operation_id: OperationId) -> Option<&ConflictResolution> {
        self.conflicts.get(&operation_id)
    }

    /// Records parked behind an open manual conflict
    pub fn blocked_entities(&self) -> BTreeSet<EntityRef> {
        self.open().map(ConflictResolution::entity_ref).collect()
    }

    pub fn open(&self) -> impl Iterator<Item = &ConflictResolution> {
        self.conflicts.values().filter(|conflict| conflict.is_blocking())
    }

    /// Every conflict, oldest detection first
    pub fn all(&self) -> Vec<ConflictResolution> {
        let mut conflicts: Vec<ConflictResolution> = self.conflicts.values().cloned().collect();
        conflicts.sort_by_key(|conflict| (conflict.detected_at, conflict.operation_id));
        conflicts
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}
