//! Sync engine facade.
//!
//! [`SyncEngine`] is a cloneable handle over the operation log, conflict
//! ledger and scheduler phase. Local mutations may be appended at any time,
//! including while a cycle is transmitting: the engine lock is never held
//! across a transport call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};

use crate::config::EngineConfig;
use crate::env::{Clock, Connectivity};
use crate::error::{Error, Result};
use crate::models::{
    ConflictResolution, CrdtOperation, DeviceId, EntityRef, LocalEffect, OfflineState,
    OperationId, OperationType, Priority, Resolution, SyncEvent, SyncStatus,
};
use crate::oplog::{AppendOutcome, OperationDraft, OperationLog};
use crate::queue::{QueueConfig, SyncQueue};
use crate::resolver::{ConflictLedger, ConflictResolver, Decision};
use crate::scheduler::{SchedulerPhase, Trigger};
use crate::state::{Listeners, StateHub, Subscription};
use crate::storage::KeyValueStore;
use crate::transport::{BatchResult, OutboundOperation, Transport, TransportError};

#[cfg(test)]
mod tests;

/// How a sync cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Queue drained (or batch limit reached) without transport failure
    Completed,
    /// Another cycle was already running
    Coalesced,
    /// Engine offline; nothing attempted
    Offline,
    /// Periodic trigger inside a backoff window
    Deferred,
    /// A batch failed as a whole; events are failed and retried later
    TransportFailed,
    /// Connectivity dropped mid-transmission; events stay in flight
    Abandoned,
}

/// Summary of one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub status: CycleStatus,
    pub batches: usize,
    pub transmitted: usize,
    pub synced: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub discarded: usize,
    pub requeued: usize,
    pub reclaimed: usize,
}

impl CycleReport {
    const fn new(status: CycleStatus) -> Self {
        Self {
            status,
            batches: 0,
            transmitted: 0,
            synced: 0,
            failed: 0,
            conflicts: 0,
            discarded: 0,
            requeued: 0,
            reclaimed: 0,
        }
    }
}

/// An unconfirmed operation with its delivery state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub operation: CrdtOperation,
    pub event: SyncEvent,
}

struct EngineInner {
    log: OperationLog,
    ledger: ConflictLedger,
    phase: SchedulerPhase,
    sync_in_progress: bool,
}

/// Offline-first sync engine handle
pub struct SyncEngine<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    queue: SyncQueue,
    resolver: ConflictResolver,
    device_id: DeviceId,
    inner: Arc<Mutex<EngineInner>>,
    state: Arc<StateHub>,
    effects: Listeners<LocalEffect>,
    connectivity: Connectivity,
    manual: Arc<Notify>,
}

impl<S, T> Clone for SyncEngine<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            clock: Arc::clone(&self.clock),
            config: Arc::clone(&self.config),
            queue: self.queue,
            resolver: self.resolver,
            device_id: self.device_id.clone(),
            inner: Arc::clone(&self.inner),
            state: Arc::clone(&self.state),
            effects: self.effects.clone(),
            connectivity: self.connectivity.clone(),
            manual: Arc::clone(&self.manual),
        }
    }
}

impl<S: KeyValueStore, T: Transport> SyncEngine<S, T> {
    /// Load persisted state and start online
    pub async fn open(
        store: S,
        transport: T,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::open_with_connectivity(store, transport, clock, config, Connectivity::default())
            .await
    }

    /// Load persisted state, following an existing connectivity signal
    pub async fn open_with_connectivity(
        store: S,
        transport: T,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        connectivity: Connectivity,
    ) -> Result<Self> {
        config.validate()?;
        let log = OperationLog::load(&store, config.business_keys.clone()).await?;
        let ledger = ConflictLedger::load(&store).await?;
        let device_id = log.device_id().clone();

        let inner = EngineInner {
            log,
            ledger,
            phase: SchedulerPhase::Idle,
            sync_in_progress: false,
        };
        let initial = snapshot(&inner, connectivity.is_online(), config.max_retries);

        Ok(Self {
            store: Arc::new(store),
            transport: Arc::new(transport),
            clock,
            queue: SyncQueue::new(QueueConfig::from(&config)),
            resolver: ConflictResolver::from(&config),
            config: Arc::new(config),
            device_id,
            inner: Arc::new(Mutex::new(inner)),
            state: Arc::new(StateHub::new(initial)),
            effects: Listeners::new(),
            connectivity,
            manual: Arc::new(Notify::new()),
        })
    }

    pub const fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub const fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub(crate) fn manual_trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.manual)
    }

    /// Latest published state
    pub fn state(&self) -> OfflineState {
        self.state.snapshot()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&OfflineState) + Send + Sync + 'static,
    {
        self.state.subscribe(listener)
    }

    /// Changes reconciliation made to local records
    pub fn subscribe_effects<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LocalEffect) + Send + Sync + 'static,
    {
        self.effects.subscribe(listener)
    }

    pub async fn phase(&self) -> SchedulerPhase {
        self.inner.lock().await.phase
    }

    fn publish(&self, inner: &EngineInner) {
        self.state.publish(snapshot(
            inner,
            self.connectivity.is_online(),
            self.config.max_retries,
        ));
    }

    fn emit(&self, effects: &[LocalEffect]) {
        for effect in effects {
            self.effects.notify(effect);
        }
    }

    /// Record a local mutation; fails if it could not be saved
    pub async fn add_operation(
        &self,
        op_type: OperationType,
        entity: &str,
        entity_id: &str,
        data: serde_json::Value,
        priority: Priority,
    ) -> Result<AppendOutcome> {
        let draft = OperationDraft::new(op_type, entity, entity_id, data).with_priority(priority);
        let now = self.clock.now_ms();

        let mut inner = self.inner.lock().await;
        let outcome = inner.log.append(&*self.store, draft, now).await?;
        self.publish(&inner);
        drop(inner);

        if let AppendOutcome::Collapsed { removed } = &outcome {
            tracing::info!(
                "{entity}/{entity_id} deleted before sync; dropped {} operations",
                removed.len()
            );
        }
        Ok(outcome)
    }

    /// Run a cycle now
    pub async fn trigger_sync(&self) -> Result<CycleReport> {
        self.run_cycle(Trigger::Manual).await
    }

    /// Ask a running scheduler for a cycle
    pub fn request_sync(&self) {
        self.manual.notify_one();
    }

    pub fn set_online(&self, online: bool) {
        if self.connectivity.set_online(online) {
            tracing::info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
            let state = OfflineState {
                is_online: online,
                ..self.state.snapshot()
            };
            self.state.publish(state);
        }
    }

    pub async fn pending_operations(&self) -> Vec<QueuedOperation> {
        let inner = self.inner.lock().await;
        inner
            .log
            .entries()
            .map(|(operation, event)| QueuedOperation {
                operation: operation.clone(),
                event: event.clone(),
            })
            .collect()
    }

    /// Time until the earliest retryable failure is due; `None` if none is
    pub async fn next_retry_in(&self) -> Option<Duration> {
        let now = self.clock.now_ms();
        let inner = self.inner.lock().await;
        let due = inner
            .log
            .by_status(SyncStatus::Failed)
            .into_iter()
            .filter_map(|(_, event)| self.queue.retry_due_at(event))
            .min()?;
        Some(Duration::from_millis(
            u64::try_from(due.saturating_sub(now)).unwrap_or(0),
        ))
    }

    pub async fn conflicts(&self) -> Vec<ConflictResolution> {
        self.inner.lock().await.ledger.all()
    }

    /// Put a failed operation back in the queue with a fresh retry budget
    pub async fn retry_failed(&self, operation_id: OperationId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.log.retry(&*self.store, operation_id).await?;
        tracing::info!("Retrying operation {operation_id} on request");
        self.publish(&inner);
        Ok(())
    }

    /// Drop a permanently failed operation on request
    pub async fn dismiss_failed(&self, operation_id: OperationId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .log
            .event(operation_id)
            .ok_or_else(|| Error::NotFound(format!("operation {operation_id}")))?;
        if !event.is_exhausted(self.config.max_retries) {
            return Err(Error::InvalidInput(format!(
                "operation {operation_id} has not permanently failed"
            )));
        }
        if let Some(operation) = inner.log.operation(operation_id) {
            tracing::warn!(
                "Dismissing failed {} on {}/{} ({operation_id}); the change is discarded",
                operation.op_type,
                operation.entity,
                operation.entity_id
            );
        }
        inner.log.discard(&*self.store, &[operation_id]).await?;
        self.publish(&inner);
        Ok(())
    }

    /// Apply a user decision to a held conflict and release the record
    pub async fn resolve_conflict_manually(
        &self,
        operation_id: OperationId,
        resolution: Resolution,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        let conflict = inner
            .ledger
            .get(operation_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("conflict for operation {operation_id}")))?;
        let local = inner
            .log
            .operation(operation_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("operation {operation_id}")))?;
        let decision = self
            .resolver
            .resolve_manually(&conflict, &local, resolution, now)?;

        if let Some(remote) = &conflict.remote {
            inner
                .log
                .observe_remote_clock(&*self.store, &remote.vector_clock)
                .await?;
        }

        let mut report = CycleReport::new(CycleStatus::Completed);
        let mut effects = Vec::new();
        self.apply(
            &mut inner,
            &local,
            decision,
            &BTreeMap::new(),
            now,
            &mut effects,
            &mut report,
        )
        .await?;
        tracing::info!(
            "Resolved conflict on {}/{} as {resolution}",
            conflict.entity,
            conflict.entity_id
        );
        self.publish(&inner);
        drop(inner);

        self.emit(&effects);
        self.request_sync();
        Ok(())
    }

    /// Run one sync cycle (single flight; concurrent requests coalesce)
    pub async fn run_cycle(&self, trigger: Trigger) -> Result<CycleReport> {
        let now = self.clock.now_ms();
        let mut report = {
            let mut inner = self.inner.lock().await;
            if inner.sync_in_progress {
                tracing::debug!("Sync already running; {trigger} request coalesced");
                return Ok(CycleReport::new(CycleStatus::Coalesced));
            }
            if !self.connectivity.is_online() {
                tracing::debug!("Offline; skipping {trigger} sync");
                return Ok(CycleReport::new(CycleStatus::Offline));
            }
            if let SchedulerPhase::Backoff { until } = inner.phase {
                if trigger == Trigger::Interval && now < until {
                    tracing::debug!("In backoff for another {}ms", until - now);
                    return Ok(CycleReport::new(CycleStatus::Deferred));
                }
            }

            inner.sync_in_progress = true;
            inner.phase = SchedulerPhase::Running;
            let prepared = self.prepare(&mut inner, now).await;
            if prepared.is_err() {
                inner.sync_in_progress = false;
                inner.phase = SchedulerPhase::Idle;
            }
            let report = prepared?;
            self.publish(&inner);
            report
        };

        tracing::debug!("Sync cycle started ({trigger})");
        let driven = self.drive(&mut report).await;

        let mut inner = self.inner.lock().await;
        inner.sync_in_progress = false;
        inner.phase = match (&driven, inner.phase) {
            (Ok(()), SchedulerPhase::Backoff { until }) => SchedulerPhase::Backoff { until },
            _ => SchedulerPhase::Idle,
        };
        let finished = if driven.is_ok() && report.status == CycleStatus::Completed {
            inner
                .log
                .set_last_sync(&*self.store, self.clock.now_ms())
                .await
        } else {
            Ok(())
        };
        self.publish(&inner);
        drop(inner);

        driven?;
        finished?;
        tracing::info!(
            "Sync cycle {:?}: {} batches, {} sent, {} synced, {} failed, {} conflicts",
            report.status,
            report.batches,
            report.transmitted,
            report.synced,
            report.failed,
            report.conflicts
        );
        Ok(report)
    }

    async fn prepare(&self, inner: &mut EngineInner, now: i64) -> Result<CycleReport> {
        let mut report = CycleReport::new(CycleStatus::Completed);
        report.reclaimed = self
            .queue
            .reclaim_abandoned(&*self.store, &mut inner.log, now)
            .await?
            .len();
        report.requeued = self
            .queue
            .requeue_failed(&*self.store, &mut inner.log, now)
            .await?
            .len();
        Ok(report)
    }

    /// Pull, transmit and reconcile batches until the queue drains
    async fn drive(&self, report: &mut CycleReport) -> Result<()> {
        for _ in 0..self.config.max_batches_per_cycle {
            let batch = {
                let mut inner = self.inner.lock().await;
                let blocked = inner.ledger.blocked_entities();
                let ids = self.queue.next_batch(&inner.log, &blocked);
                if ids.is_empty() {
                    return Ok(());
                }
                inner
                    .log
                    .mark_syncing(&*self.store, &ids, self.clock.now_ms())
                    .await?;
                outbound(&inner.log, &ids)
            };
            report.batches += 1;
            report.transmitted += batch.len();
            tracing::debug!("Transmitting batch of {} operations", batch.len());

            let timeout = self.config.transmit_timeout();
            let mut connectivity = self.connectivity.subscribe();
            let sent = tokio::select! {
                sent = tokio::time::timeout(timeout, self.transport.send(&batch)) => {
                    sent.unwrap_or(Err(TransportError::Timeout(timeout)))
                }
                Ok(_) = connectivity.wait_for(|online| !*online) => {
                    tracing::warn!(
                        "Connectivity lost mid-cycle; abandoning batch of {}",
                        batch.len()
                    );
                    report.status = CycleStatus::Abandoned;
                    return Ok(());
                }
            };

            match sent {
                Ok(result) => self.reconcile(&batch, &result, report).await?,
                Err(error) => {
                    self.fail_batch(&batch, &error).await?;
                    report.failed += batch.len();
                    report.status = CycleStatus::TransportFailed;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn fail_batch(&self, batch: &[OutboundOperation], error: &TransportError) -> Result<()> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;
        let message = error.to_string();
        let mut highest_retry = 0;
        for outbound in batch {
            let id = outbound.operation.id;
            let Some(event) = inner.log.event(id) else {
                continue;
            };
            highest_retry = highest_retry.max(event.retry_count);
            inner
                .log
                .mark_failed(&*self.store, id, &message, true, now)
                .await?;
        }
        let delay = self.queue.backoff_delay(highest_retry);
        let until = now.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
        inner.phase = SchedulerPhase::Backoff { until };
        tracing::warn!(
            "Batch of {} failed: {message}; backing off {}ms",
            batch.len(),
            delay.as_millis()
        );
        self.publish(&inner);
        Ok(())
    }

    /// Route every outcome of a delivered batch through the resolver
    async fn reconcile(
        &self,
        batch: &[OutboundOperation],
        result: &BatchResult,
        report: &mut CycleReport,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        let mut effects = Vec::new();
        let mut inner = self.inner.lock().await;

        // In-batch operations not reconciled yet, and whether they were accepted
        let mut unprocessed: BTreeMap<OperationId, bool> = batch
            .iter()
            .map(|outbound| {
                let id = outbound.operation.id;
                (id, result.outcome(id).is_some_and(|outcome| outcome.accepted))
            })
            .collect();
        let mut held: BTreeSet<EntityRef> = BTreeSet::new();

        for outbound in batch {
            let id = outbound.operation.id;
            unprocessed.remove(&id);
            // Consumed by an earlier rebase or discard in this batch
            let Some(local) = inner.log.operation(id).cloned() else {
                continue;
            };
            let Some(outcome) = result.outcome(id) else {
                tracing::warn!("Remote returned no outcome for operation {id}");
                inner
                    .log
                    .mark_failed(&*self.store, id, "no outcome reported by remote", true, now)
                    .await?;
                report.failed += 1;
                continue;
            };

            let record = local.entity_ref();
            if held.contains(&record) && !outcome.accepted {
                inner.log.reset_to_pending(&*self.store, &[id]).await?;
                continue;
            }

            let decision = self.resolver.classify(&local, outcome, now);
            if matches!(decision, Decision::Hold { .. }) {
                held.insert(record);
            } else if let Some(clock) = &outcome.remote_vector_clock {
                inner.log.observe_remote_clock(&*self.store, clock).await?;
            }
            self.apply(
                &mut inner,
                &local,
                decision,
                &unprocessed,
                now,
                &mut effects,
                report,
            )
            .await?;
        }

        self.publish(&inner);
        drop(inner);
        self.emit(&effects);
        Ok(())
    }

    /// Later operations on the same record that must move with `local`.
    ///
    /// In-batch operations are included even when the remote accepted them:
    /// they are re-sent after the replacement of `local` so the remote
    /// ends on the latest local write.
    fn followers(
        log: &OperationLog,
        local: &CrdtOperation,
        unprocessed: &BTreeMap<OperationId, bool>,
    ) -> Vec<CrdtOperation> {
        log.pending_by_entity(&local.entity_ref())
            .into_iter()
            .filter(|operation| operation.version > local.version)
            .filter(|operation| {
                log.event(operation.id).is_some_and(|event| match event.status {
                    SyncStatus::Pending | SyncStatus::Failed => true,
                    SyncStatus::Syncing => unprocessed.contains_key(&operation.id),
                    SyncStatus::Synced => false,
                })
            })
            .cloned()
            .collect()
    }

    fn redraft(log: &OperationLog, operation: &CrdtOperation, entity_id: &str) -> OperationDraft {
        let priority = log
            .event(operation.id)
            .map_or_else(Priority::default, |event| event.priority);
        OperationDraft::new(
            operation.op_type,
            operation.entity.clone(),
            entity_id,
            operation.data.clone(),
        )
        .with_priority(priority)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        inner: &mut EngineInner,
        local: &CrdtOperation,
        decision: Decision,
        unprocessed: &BTreeMap<OperationId, bool>,
        now: i64,
        effects: &mut Vec<LocalEffect>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let store = &*self.store;
        match decision {
            Decision::Synced => {
                inner.log.mark_synced(store, local.id).await?;
                report.synced += 1;
            }
            Decision::Rejected { error } => {
                tracing::warn!(
                    "Remote rejected {} on {}/{}: {error}",
                    local.op_type,
                    local.entity,
                    local.entity_id
                );
                inner
                    .log
                    .mark_failed(store, local.id, &error, false, now)
                    .await?;
                report.failed += 1;
            }
            Decision::Discard {
                conflict,
                effect,
                entity_wide,
            } => {
                let ids: Vec<OperationId> = if entity_wide {
                    inner
                        .log
                        .pending_by_entity(&local.entity_ref())
                        .into_iter()
                        .map(|operation| operation.id)
                        .filter(|id| *id == local.id || unprocessed.get(id) != Some(&true))
                        .collect()
                } else {
                    vec![local.id]
                };
                tracing::warn!(
                    "{} conflict on {}/{}: remote wins, discarding {} local operations",
                    conflict.conflict_type,
                    local.entity,
                    local.entity_id,
                    ids.len()
                );
                inner.log.discard(store, &ids).await?;
                inner.ledger.record(store, conflict).await?;
                effects.extend(effect);
                report.conflicts += 1;
                report.discarded += ids.len();
            }
            Decision::Rebase {
                conflict,
                op_type,
                data,
                effect,
            } => {
                let followers = Self::followers(&inner.log, local, unprocessed);
                let mut remove = vec![local.id];
                let mut drafts = vec![OperationDraft {
                    op_type,
                    data,
                    ..Self::redraft(&inner.log, local, &local.entity_id)
                }];
                for follower in &followers {
                    remove.push(follower.id);
                    drafts.push(Self::redraft(&inner.log, follower, &follower.entity_id));
                }
                tracing::info!(
                    "{} conflict on {}/{}: {}, re-queued {} operations",
                    conflict.conflict_type,
                    local.entity,
                    local.entity_id,
                    conflict.resolution,
                    drafts.len()
                );
                inner.log.replace(store, &remove, drafts, now).await?;
                inner.ledger.record(store, conflict).await?;
                effects.extend(effect);
                report.conflicts += 1;
            }
            Decision::Hold { conflict } => {
                tracing::warn!(
                    "{} conflict on {}/{} needs manual resolution; holding the record",
                    conflict.conflict_type,
                    local.entity,
                    local.entity_id
                );
                if inner
                    .log
                    .event(local.id)
                    .is_some_and(|event| event.status == SyncStatus::Syncing)
                {
                    inner.log.reset_to_pending(store, &[local.id]).await?;
                }
                inner.ledger.record(store, conflict).await?;
                report.conflicts += 1;
            }
            Decision::Remap {
                conflict,
                canonical_id,
            } => {
                let followers = Self::followers(&inner.log, local, unprocessed);
                let mut remove = vec![local.id];
                let mut drafts = Vec::with_capacity(followers.len());
                for follower in &followers {
                    remove.push(follower.id);
                    drafts.push(Self::redraft(&inner.log, follower, &canonical_id));
                }
                tracing::warn!(
                    "Create of {}/{} duplicates remote record {canonical_id}; remapping",
                    local.entity,
                    local.entity_id
                );
                inner.log.replace(store, &remove, drafts, now).await?;
                inner.ledger.record(store, conflict).await?;
                effects.push(LocalEffect::RemapId {
                    entity: local.entity.clone(),
                    from: local.entity_id.clone(),
                    to: canonical_id,
                });
                report.conflicts += 1;
                report.discarded += 1;
            }
        }
        Ok(())
    }
}

fn outbound(log: &OperationLog, ids: &[OperationId]) -> Vec<OutboundOperation> {
    ids.iter()
        .filter_map(|id| {
            let operation = log.operation(*id)?;
            let event = log.event(*id)?;
            Some(OutboundOperation {
                operation: operation.clone(),
                priority: event.priority,
                attempt: event.attempts,
            })
        })
        .collect()
}

fn snapshot(inner: &EngineInner, is_online: bool, max_retries: u32) -> OfflineState {
    OfflineState {
        is_online,
        last_sync: inner.log.device().last_sync,
        pending_operations: inner.log.pending_count(max_retries),
        failed_operations: inner.log.permanently_failed(max_retries),
        conflict_resolution: inner.ledger.all(),
        sync_in_progress: inner.sync_in_progress,
        device_id: inner.log.device_id().clone(),
    }
}
