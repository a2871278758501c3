//! Durable operation log.
//!
//! The log exclusively owns every [`CrdtOperation`] that has not been
//! confirmed by the remote, the [`SyncEvent`] tracking its delivery, and the
//! device metadata holding the running merged vector clock. Every mutation is
//! written to the store as one [`WriteBatch`] before the in-memory view
//! changes, so a failed write leaves both untouched.
//!
//! Key layout:
//!
//! | key                                          | value              |
//! |----------------------------------------------|--------------------|
//! | `meta/device`                                | [`DeviceMetadata`] |
//! | `op/{operation_id}`                          | [`CrdtOperation`]  |
//! | `event/{operation_id}`                       | [`SyncEvent`]      |
//! | `index/{entity}/{entity_id}/{version:020}`   | operation id       |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::error::{Error, Result};
use crate::models::{
    CrdtOperation, DeviceId, EntityRef, FailedOperation, OperationId, OperationType, Priority,
    SyncEvent, SyncStatus,
};
use crate::storage::{get_json, KeyValueStore, WriteBatch};

pub const META_KEY: &str = "meta/device";
pub const OP_PREFIX: &str = "op/";
pub const EVENT_PREFIX: &str = "event/";
pub const INDEX_PREFIX: &str = "index/";

fn op_key(id: OperationId) -> String {
    format!("{OP_PREFIX}{id}")
}

fn event_key(id: OperationId) -> String {
    format!("{EVENT_PREFIX}{id}")
}

fn index_key(entity: &str, entity_id: &str, version: u64) -> String {
    format!("{INDEX_PREFIX}{entity}/{entity_id}/{version:020}")
}

/// Device identity plus the running merged clock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    pub device_id: DeviceId,
    pub clock: VectorClock,
    /// Last completed sync cycle (Unix ms)
    #[serde(default)]
    pub last_sync: Option<i64>,
}

impl DeviceMetadata {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            clock: VectorClock::new(),
            last_sync: None,
        }
    }
}

/// A local mutation before it is stamped and appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDraft {
    pub entity: String,
    pub entity_id: String,
    pub op_type: OperationType,
    pub data: serde_json::Value,
    pub priority: Priority,
}

impl OperationDraft {
    pub fn new(
        op_type: OperationType,
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            entity: entity.into(),
            entity_id: entity_id.into(),
            op_type,
            data,
            priority: Priority::default(),
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Reject drafts the log cannot store or the remote cannot apply
    pub fn validate(&self) -> Result<()> {
        for (label, value) in [("entity", &self.entity), ("entity id", &self.entity_id)] {
            if value.trim().is_empty() {
                return Err(Error::InvalidInput(format!("{label} must not be empty")));
            }
            if value.contains('/') {
                return Err(Error::InvalidInput(format!(
                    "{label} '{value}' must not contain '/'"
                )));
            }
        }
        match self.op_type {
            OperationType::Create | OperationType::Update if !self.data.is_object() => {
                Err(Error::InvalidInput(format!(
                    "{} payload must be a JSON object",
                    self.op_type
                )))
            }
            _ => Ok(()),
        }
    }

    fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity.clone(), self.entity_id.clone())
    }
}

/// Result of [`OperationLog::append`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(CrdtOperation),
    /// A delete cancelled an untransmitted create; these ops were removed
    Collapsed { removed: Vec<OperationId> },
}

impl AppendOutcome {
    pub const fn operation(&self) -> Option<&CrdtOperation> {
        match self {
            Self::Appended(operation) => Some(operation),
            Self::Collapsed { .. } => None,
        }
    }
}

/// Unconfirmed local operations and their delivery state
#[derive(Debug, Clone)]
pub struct OperationLog {
    device: DeviceMetadata,
    operations: BTreeMap<OperationId, CrdtOperation>,
    events: BTreeMap<OperationId, SyncEvent>,
    business_keys: BTreeMap<String, String>,
}

impl OperationLog {
    /// Load the log from `store`, creating device metadata on first run.
    ///
    /// Events persisted as `syncing` belonged to a cycle that did not survive
    /// the restart and are reset to `pending`. Leftover synced records and
    /// index entries without an operation are removed.
    pub async fn load<S: KeyValueStore>(
        store: &S,
        business_keys: BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut repair = WriteBatch::new();

        let device = if let Some(device) = get_json::<_, DeviceMetadata>(store, META_KEY).await? {
            device
        } else {
            let device = DeviceMetadata::new(DeviceId::generate());
            tracing::info!("Registered new device {}", device.device_id);
            repair.put_json(META_KEY, &device)?;
            device
        };

        let mut operations = BTreeMap::new();
        for key in store.keys_with_prefix(OP_PREFIX).await? {
            if let Some(operation) = get_json::<_, CrdtOperation>(store, &key).await? {
                operations.insert(operation.id, operation);
            }
        }

        let mut events = BTreeMap::new();
        for key in store.keys_with_prefix(EVENT_PREFIX).await? {
            let Some(mut event) = get_json::<_, SyncEvent>(store, &key).await? else {
                continue;
            };
            if !operations.contains_key(&event.operation_id) {
                tracing::warn!("Dropping sync event without operation: {key}");
                repair.delete(key);
                continue;
            }
            match event.status {
                SyncStatus::Syncing => {
                    event.status = SyncStatus::Pending;
                    event.syncing_since = None;
                    repair.put_json(key, &event)?;
                }
                SyncStatus::Synced => {
                    repair.delete(key);
                    repair.delete(op_key(event.operation_id));
                    if let Some(operation) = operations.remove(&event.operation_id) {
                        repair.delete(index_key(
                            &operation.entity,
                            &operation.entity_id,
                            operation.version,
                        ));
                    }
                    continue;
                }
                SyncStatus::Pending | SyncStatus::Failed => {}
            }
            events.insert(event.operation_id, event);
        }

        for operation in operations.values() {
            if !events.contains_key(&operation.id) {
                tracing::warn!("Operation {} had no sync event; requeueing", operation.id);
                let event = SyncEvent::new(operation.id, Priority::default());
                repair.put_json(event_key(operation.id), &event)?;
                events.insert(operation.id, event);
            }
        }

        for key in store.keys_with_prefix(INDEX_PREFIX).await? {
            let indexed = store
                .get(&key)
                .await?
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .and_then(|id| id.parse::<OperationId>().ok());
            if indexed.is_none_or(|id| !operations.contains_key(&id)) {
                repair.delete(key);
            }
        }

        if !repair.is_empty() {
            tracing::debug!("Repairing {} log records on load", repair.len());
            store.write_batch(repair).await?;
        }

        tracing::info!(
            "Loaded operation log for device {} ({} unconfirmed operations)",
            device.device_id,
            operations.len()
        );

        Ok(Self {
            device,
            operations,
            events,
            business_keys,
        })
    }

    pub const fn device(&self) -> &DeviceMetadata {
        &self.device
    }

    pub const fn device_id(&self) -> &DeviceId {
        &self.device.device_id
    }

    /// Running merged clock of this device
    pub const fn clock(&self) -> &VectorClock {
        &self.device.clock
    }

    /// Append a local mutation.
    ///
    /// A delete on a record whose create never left the device removes every
    /// operation of that record instead, and nothing is transmitted.
    pub async fn append<S: KeyValueStore>(
        &mut self,
        store: &S,
        draft: OperationDraft,
        now: i64,
    ) -> Result<AppendOutcome> {
        draft.validate()?;

        if draft.op_type == OperationType::Delete {
            let target = draft.entity_ref();
            if let Some(removed) = self.collapsible(&target) {
                self.discard(store, &removed).await?;
                tracing::info!(
                    "Delete of unsynced {target} cancelled {} pending operations",
                    removed.len()
                );
                return Ok(AppendOutcome::Collapsed { removed });
            }
        }

        let mut appended = self.replace(store, &[], vec![draft], now).await?;
        let operation = appended
            .pop()
            .ok_or_else(|| Error::Storage("append produced no operation".to_string()))?;
        tracing::debug!(
            "Appended {} {}/{} v{}",
            operation.op_type,
            operation.entity,
            operation.entity_id,
            operation.version
        );
        Ok(AppendOutcome::Appended(operation))
    }

    /// Ids of every operation on `target` when all of them are untransmitted
    /// and one of them is the create
    fn collapsible(&self, target: &EntityRef) -> Option<Vec<OperationId>> {
        let chain = self.pending_by_entity(target);
        let has_create = chain
            .iter()
            .any(|operation| operation.op_type == OperationType::Create);
        let untransmitted = chain.iter().all(|operation| {
            self.events
                .get(&operation.id)
                .is_some_and(SyncEvent::is_untransmitted)
        });
        (has_create && untransmitted).then(|| chain.iter().map(|operation| operation.id).collect())
    }

    /// Atomically remove `remove` and append `drafts` in order.
    ///
    /// Appended operations are stamped from the running clock, so each one
    /// dominates everything the device has observed so far.
    pub async fn replace<S: KeyValueStore>(
        &mut self,
        store: &S,
        remove: &[OperationId],
        drafts: Vec<OperationDraft>,
        now: i64,
    ) -> Result<Vec<CrdtOperation>> {
        for draft in &drafts {
            draft.validate()?;
        }

        let mut batch = WriteBatch::new();
        for id in remove {
            self.stage_removal(&mut batch, *id);
        }

        let mut device = self.device.clone();
        let mut staged = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let version = device.clock.increment(device.device_id.as_str());
            let business_key = self.business_key_for(&draft);
            let operation = CrdtOperation {
                id: OperationId::new(),
                op_type: draft.op_type,
                entity: draft.entity,
                entity_id: draft.entity_id,
                data: draft.data,
                timestamp: now,
                device_id: device.device_id.clone(),
                version,
                vector_clock: device.clock.clone(),
                business_key,
            };
            let event = SyncEvent::new(operation.id, draft.priority);

            batch.put_json(op_key(operation.id), &operation)?;
            batch.put_json(event_key(operation.id), &event)?;
            batch.put(
                index_key(&operation.entity, &operation.entity_id, version),
                operation.id.to_string().into_bytes(),
            );
            staged.push((operation, event));
        }
        if !staged.is_empty() {
            batch.put_json(META_KEY, &device)?;
        }

        store.write_batch(batch).await?;

        for id in remove {
            self.operations.remove(id);
            self.events.remove(id);
        }
        self.device = device;
        Ok(staged
            .into_iter()
            .map(|(operation, event)| {
                self.events.insert(operation.id, event);
                self.operations.insert(operation.id, operation.clone());
                operation
            })
            .collect())
    }

    fn business_key_for(&self, draft: &OperationDraft) -> Option<String> {
        if draft.op_type != OperationType::Create {
            return None;
        }
        let field = self.business_keys.get(&draft.entity)?;
        match draft.data.get(field)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(value) => Some(value.clone()),
            other => Some(other.to_string()),
        }
    }

    fn stage_removal(&self, batch: &mut WriteBatch, id: OperationId) {
        batch.delete(op_key(id));
        batch.delete(event_key(id));
        if let Some(operation) = self.operations.get(&id) {
            batch.delete(index_key(
                &operation.entity,
                &operation.entity_id,
                operation.version,
            ));
        }
    }

    /// Remove operations with their events and index entries
    pub async fn discard<S: KeyValueStore>(
        &mut self,
        store: &S,
        ids: &[OperationId],
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for id in ids {
            self.stage_removal(&mut batch, *id);
        }
        store.write_batch(batch).await?;
        for id in ids {
            self.operations.remove(id);
            self.events.remove(id);
        }
        Ok(())
    }

    /// Persist a batch of event updates, then apply them in memory
    async fn update_events<S, F>(&mut self, store: &S, ids: &[OperationId], update: F) -> Result<()>
    where
        S: KeyValueStore,
        F: Fn(&mut SyncEvent),
    {
        let mut batch = WriteBatch::new();
        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            let mut event = self
                .events
                .get(id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("sync event {id}")))?;
            update(&mut event);
            batch.put_json(event_key(*id), &event)?;
            updated.push(event);
        }
        if batch.is_empty() {
            return Ok(());
        }
        store.write_batch(batch).await?;
        for event in updated {
            self.events.insert(event.operation_id, event);
        }
        Ok(())
    }

    /// Move events into a batch in flight
    pub async fn mark_syncing<S: KeyValueStore>(
        &mut self,
        store: &S,
        ids: &[OperationId],
        now: i64,
    ) -> Result<()> {
        self.update_events(store, ids, |event| {
            event.status = SyncStatus::Syncing;
            event.attempts = event.attempts.saturating_add(1);
            event.syncing_since = Some(now);
        })
        .await
    }

    /// Confirmed by the remote: the operation is pruned from the log
    pub async fn mark_synced<S: KeyValueStore>(
        &mut self,
        store: &S,
        id: OperationId,
    ) -> Result<()> {
        if !self.events.contains_key(&id) {
            return Err(Error::NotFound(format!("sync event {id}")));
        }
        self.discard(store, &[id]).await
    }

    pub async fn mark_failed<S: KeyValueStore>(
        &mut self,
        store: &S,
        id: OperationId,
        error: &str,
        retryable: bool,
        now: i64,
    ) -> Result<()> {
        self.update_events(store, &[id], |event| {
            event.status = SyncStatus::Failed;
            event.error = Some(error.to_string());
            event.retryable = retryable;
            event.last_retry = Some(now);
            event.syncing_since = None;
        })
        .await
    }

    /// Backoff-scheduled retry: back to pending, one more retry used
    pub async fn requeue<S: KeyValueStore>(&mut self, store: &S, id: OperationId) -> Result<()> {
        self.update_events(store, &[id], |event| {
            event.status = SyncStatus::Pending;
            event.retry_count = event.retry_count.saturating_add(1);
            event.syncing_since = None;
        })
        .await
    }

    /// Back to pending without touching the retry budget (abandoned or held)
    pub async fn reset_to_pending<S: KeyValueStore>(
        &mut self,
        store: &S,
        ids: &[OperationId],
    ) -> Result<()> {
        self.update_events(store, ids, |event| {
            event.status = SyncStatus::Pending;
            event.syncing_since = None;
        })
        .await
    }

    /// User-requested retry of a failed operation with a fresh retry budget
    pub async fn retry<S: KeyValueStore>(&mut self, store: &S, id: OperationId) -> Result<()> {
        match self.events.get(&id) {
            Some(event) if event.status == SyncStatus::Failed => {}
            Some(event) => {
                return Err(Error::InvalidInput(format!(
                    "operation {id} is {}, not failed",
                    event.status
                )))
            }
            None => return Err(Error::NotFound(format!("operation {id}"))),
        }
        self.update_events(store, &[id], |event| {
            event.status = SyncStatus::Pending;
            event.retry_count = 0;
            event.retryable = true;
            event.error = None;
            event.last_retry = None;
        })
        .await
    }

    /// Merge a clock reported by the remote into the running device clock
    pub async fn observe_remote_clock<S: KeyValueStore>(
        &mut self,
        store: &S,
        clock: &VectorClock,
    ) -> Result<bool> {
        let mut device = self.device.clone();
        if !device.clock.merge_from(clock) {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        batch.put_json(META_KEY, &device)?;
        store.write_batch(batch).await?;
        self.device = device;
        Ok(true)
    }

    pub async fn set_last_sync<S: KeyValueStore>(&mut self, store: &S, now: i64) -> Result<()> {
        let mut device = self.device.clone();
        device.last_sync = Some(now);
        let mut batch = WriteBatch::new();
        batch.put_json(META_KEY, &device)?;
        store.write_batch(batch).await?;
        self.device = device;
        Ok(())
    }

    pub fn operation(&self, id: OperationId) -> Option<&CrdtOperation> {
        self.operations.get(&id)
    }

    pub fn event(&self, id: OperationId) -> Option<&SyncEvent> {
        self.events.get(&id)
    }

    /// Operations and events, in id (creation) order
    pub fn entries(&self) -> impl Iterator<Item = (&CrdtOperation, &SyncEvent)> {
        self.operations
            .values()
            .filter_map(|operation| Some((operation, self.events.get(&operation.id)?)))
    }

    /// Unconfirmed operations on one record, version ascending
    pub fn pending_by_entity(&self, target: &EntityRef) -> Vec<&CrdtOperation> {
        let mut chain: Vec<&CrdtOperation> = self
            .operations
            .values()
            .filter(|operation| operation.targets(target))
            .collect();
        chain.sort_by_key(|operation| (operation.version, operation.id));
        chain
    }

    pub fn by_status(&self, status: SyncStatus) -> Vec<(&CrdtOperation, &SyncEvent)> {
        self.entries()
            .filter(|(_, event)| event.status == status)
            .collect()
    }

    pub fn by_device(&self, device_id: &DeviceId) -> Vec<&CrdtOperation> {
        self.operations
            .values()
            .filter(|operation| &operation.device_id == device_id)
            .collect()
    }

    /// Operations still headed for the remote (everything not failed for good)
    pub fn pending_count(&self, max_retries: u32) -> usize {
        self.events
            .values()
            .filter(|event| !event.is_exhausted(max_retries))
            .count()
    }

    pub fn permanently_failed(&self, max_retries: u32) -> Vec<FailedOperation> {
        self.entries()
            .filter(|(_, event)| event.is_exhausted(max_retries))
            .map(|(operation, event)| FailedOperation {
                operation_id: operation.id,
                op_type: operation.op_type,
                entity: operation.entity.clone(),
                entity_id: operation.entity_id.clone(),
                error: event.error.clone(),
                retry_count: event.retry_count,
                last_retry: event.last_retry,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
