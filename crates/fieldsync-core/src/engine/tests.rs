use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::Notify;

use super::*;
use crate::clock::{ClockOrdering, VectorClock};
use crate::config::{ConflictStrategy, EngineConfig};
use crate::env::ManualClock;
use crate::models::{ConflictType, RemoteOperation};
use crate::oplog::{DeviceMetadata, META_KEY};
use crate::storage::{set_json, LibSqlStore, MemoryStore};
use crate::transport::{OperationOutcome, RemoteConflict};

type SendResult = std::result::Result<BatchResult, TransportError>;
type Reply = Box<dyn Fn(&[OutboundOperation]) -> SendResult + Send + Sync>;

/// Blocks `send` until released while armed
#[derive(Clone, Default)]
struct Gate {
    armed: Arc<AtomicBool>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[derive(Clone, Default)]
struct ScriptedTransport {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    calls: Arc<Mutex<Vec<Vec<OutboundOperation>>>>,
    gate: Gate,
}

impl ScriptedTransport {
    fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn calls(&self) -> Vec<Vec<OutboundOperation>> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Transport for ScriptedTransport {
    async fn send(&self, batch: &[OutboundOperation]) -> SendResult {
        self.calls.lock().unwrap().push(batch.to_vec());
        if self.gate.armed.load(Ordering::SeqCst) {
            self.gate.entered.notify_one();
            self.gate.release.notified().await;
        }
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(reply) => reply(batch),
            None => Ok(accept_all(batch)),
        }
    }
}

fn accept_all(batch: &[OutboundOperation]) -> BatchResult {
    BatchResult::new(
        batch
            .iter()
            .map(|outbound| {
                OperationOutcome::accepted(
                    outbound.operation.id,
                    Some(outbound.operation.vector_clock.clone()),
                )
            })
            .collect(),
    )
}

fn conflict_all(conflict: RemoteConflict) -> Reply {
    Box::new(move |batch| {
        Ok(BatchResult::new(
            batch
                .iter()
                .map(|outbound| OperationOutcome::conflict(outbound.operation.id, conflict.clone()))
                .collect(),
        ))
    })
}

fn fail_with(error: TransportError) -> Reply {
    Box::new(move |_| Err(error.clone()))
}

fn clock_of(entries: &[(&str, u64)]) -> VectorClock {
    entries.iter().map(|(device, count)| (*device, *count)).collect()
}

fn remote_update(data: Value, clock: VectorClock, timestamp: i64) -> RemoteOperation {
    RemoteOperation {
        op_type: Some(OperationType::Update),
        data,
        version: 2,
        timestamp,
        device_id: Some("B".to_string()),
        vector_clock: clock,
    }
}

fn concurrent_update(remote: RemoteOperation) -> RemoteConflict {
    RemoteConflict {
        conflict_type: ConflictType::ConcurrentUpdate,
        remote: Some(remote),
        canonical_id: None,
    }
}

async fn seed_device(store: &MemoryStore, device: &str, clock: VectorClock) {
    let mut metadata = DeviceMetadata::new(DeviceId::new(device));
    metadata.clock = clock;
    set_json(store, META_KEY, &metadata).await.unwrap();
}

struct Harness {
    engine: SyncEngine<MemoryStore, ScriptedTransport>,
    transport: ScriptedTransport,
    store: MemoryStore,
    clock: ManualClock,
    effects: Arc<Mutex<Vec<LocalEffect>>>,
    _effects: Subscription,
}

impl Harness {
    async fn new(config: EngineConfig) -> Self {
        let store = MemoryStore::new();
        seed_device(&store, "A", clock_of(&[("A", 1), ("B", 1)])).await;
        Self::with_store(store, config).await
    }

    async fn with_store(store: MemoryStore, config: EngineConfig) -> Self {
        let transport = ScriptedTransport::default();
        let clock = ManualClock::new(1_000);
        let engine = SyncEngine::open(
            store.clone(),
            transport.clone(),
            Arc::new(clock.clone()),
            config.without_auto_sync(),
        )
        .await
        .unwrap();
        let effects = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&effects);
        let subscription = engine.subscribe_effects(move |effect| {
            sink.lock().unwrap().push(effect.clone());
        });
        Self {
            engine,
            transport,
            store,
            clock,
            effects,
            _effects: subscription,
        }
    }

    async fn add(
        &self,
        op_type: OperationType,
        entity_id: &str,
        data: Value,
        priority: Priority,
    ) -> AppendOutcome {
        self.engine
            .add_operation(op_type, "products", entity_id, data, priority)
            .await
            .unwrap()
    }

    async fn update(&self, entity_id: &str, data: Value) -> CrdtOperation {
        self.add(OperationType::Update, entity_id, data, Priority::Medium)
            .await
            .operation()
            .cloned()
            .unwrap()
    }

    fn effects(&self) -> Vec<LocalEffect> {
        self.effects.lock().unwrap().clone()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_syncs_and_notifies_once_idle() {
    let harness = Harness::new(EngineConfig::default()).await;
    harness
        .add(
            OperationType::Create,
            "p1",
            json!({ "name": "Valve", "qty": 4 }),
            Priority::High,
        )
        .await;
    assert_eq!(harness.engine.state().pending_operations, 1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = harness.engine.subscribe(move |state| {
        sink.lock().unwrap().push(state.clone());
    });

    harness.clock.set(5_000);
    let report = harness.engine.trigger_sync().await.unwrap();

    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.synced, 1);
    let state = harness.engine.state();
    assert_eq!(state.pending_operations, 0);
    assert_eq!(state.last_sync, Some(5_000));

    let seen = seen.lock().unwrap();
    let idle: Vec<&OfflineState> = seen.iter().filter(|s| !s.sync_in_progress).collect();
    assert_eq!(idle.len(), 1);
    assert!(!seen.last().unwrap().sync_in_progress);
    assert!(seen.first().unwrap().sync_in_progress);

    let calls = harness.transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0].priority, Priority::High);
    assert_eq!(calls[0][0].attempt, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_update_held_until_resolved() {
    let harness = Harness::new(EngineConfig::default()).await;
    let local = harness.update("p1", json!({ "qty": 5 })).await;
    assert_eq!(local.vector_clock, clock_of(&[("A", 2), ("B", 1)]));

    let remote = remote_update(json!({ "qty": 9 }), clock_of(&[("A", 1), ("B", 2)]), 900);
    harness.transport.push(conflict_all(concurrent_update(remote)));

    let report = harness.engine.trigger_sync().await.unwrap();
    assert_eq!(report.conflicts, 1);

    let state = harness.engine.state();
    assert_eq!(state.conflict_resolution.len(), 1);
    let conflict = &state.conflict_resolution[0];
    assert_eq!(conflict.conflict_type, ConflictType::ConcurrentUpdate);
    assert_eq!(conflict.resolution, Resolution::Manual);
    assert_eq!(conflict.operation_id, local.id);
    assert_eq!(state.pending_operations, 1);

    // Further edits to the held record stay queued
    let follower = harness.update("p1", json!({ "qty": 6 })).await;
    harness.engine.trigger_sync().await.unwrap();
    assert_eq!(harness.transport.call_count(), 1);
    assert_eq!(harness.engine.state().pending_operations, 2);

    harness
        .engine
        .resolve_conflict_manually(local.id, Resolution::LocalWins)
        .await
        .unwrap();
    let report = harness.engine.trigger_sync().await.unwrap();
    assert_eq!(report.synced, 2);

    let calls = harness.transport.calls();
    assert_eq!(calls.len(), 2);
    let sent: Vec<&Value> = calls[1].iter().map(|o| &o.operation.data).collect();
    assert_eq!(sent, vec![&json!({ "qty": 5 }), &json!({ "qty": 6 })]);
    assert!(calls[1].iter().all(|o| o.operation.id != follower.id));
    assert_eq!(
        calls[1][0]
            .operation
            .vector_clock
            .compare(&clock_of(&[("A", 1), ("B", 2)])),
        ClockOrdering::After
    );

    let state = harness.engine.state();
    assert_eq!(state.pending_operations, 0);
    assert_eq!(state.conflict_resolution[0].resolution, Resolution::LocalWins);
    assert!(state.conflict_resolution[0].resolved_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_operation_backs_off_then_fails_permanently() {
    let config = EngineConfig {
        max_retries: 3,
        retry_delay_ms: 1_000,
        ..EngineConfig::default()
    };
    let harness = Harness::new(config).await;
    for _ in 0..8 {
        harness
            .transport
            .push(fail_with(TransportError::Unreachable("no route".to_string())));
    }
    harness.update("p1", json!({ "qty": 1 })).await;

    let mut sent_at = Vec::new();
    for now in (0..=20_000).step_by(500) {
        harness.clock.set(now);
        let before = harness.transport.call_count();
        harness.engine.trigger_sync().await.unwrap();
        if harness.transport.call_count() > before {
            sent_at.push(now);
        }
    }

    assert_eq!(sent_at, vec![0, 1_000, 3_000, 7_000]);
    let delays: Vec<i64> = sent_at.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000]);

    let state = harness.engine.state();
    assert_eq!(state.pending_operations, 0);
    assert_eq!(state.failed_operations.len(), 1);
    assert_eq!(state.failed_operations[0].retry_count, 3);
    assert_eq!(
        state.failed_operations[0].error.as_deref(),
        Some("remote unreachable: no route")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_then_delete_never_reaches_remote() {
    let harness = Harness::new(EngineConfig::default()).await;
    harness
        .add(OperationType::Create, "p1", json!({ "name": "Gauge" }), Priority::Medium)
        .await;
    let outcome = harness
        .add(OperationType::Delete, "p1", Value::Null, Priority::Medium)
        .await;

    assert!(matches!(outcome, AppendOutcome::Collapsed { ref removed } if removed.len() == 1));
    assert_eq!(harness.engine.state().pending_operations, 0);
    assert!(harness.engine.pending_operations().await.is_empty());
    // Only device metadata remains
    assert_eq!(harness.store.len().await, 1);

    let report = harness.engine.trigger_sync().await.unwrap();
    assert_eq!(report.batches, 0);
    assert_eq!(harness.transport.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_request_during_cycle_is_coalesced() {
    let harness = Harness::new(EngineConfig::default()).await;
    harness.update("p1", json!({ "qty": 1 })).await;
    harness.transport.gate.armed.store(true, Ordering::SeqCst);
    let gate = harness.transport.gate.clone();

    let first = harness.engine.trigger_sync();
    let second = async {
        gate.entered.notified().await;
        assert!(harness.engine.state().sync_in_progress);
        let report = harness.engine.trigger_sync().await;
        gate.release.notify_one();
        report
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap().status, CycleStatus::Completed);
    assert_eq!(second.unwrap().status, CycleStatus::Coalesced);
    assert_eq!(harness.transport.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_append_while_transmitting() {
    let harness = Harness::new(EngineConfig::default()).await;
    harness.update("p1", json!({ "qty": 1 })).await;
    harness.transport.gate.armed.store(true, Ordering::SeqCst);
    let gate = harness.transport.gate.clone();

    let cycle = harness.engine.trigger_sync();
    let edit = async {
        gate.entered.notified().await;
        harness.transport.gate.armed.store(false, Ordering::SeqCst);
        let appended = harness.update("p2", json!({ "qty": 2 })).await;
        gate.release.notify_one();
        appended
    };
    let (report, appended) = tokio::join!(cycle, edit);

    // The new operation is picked up by the next batch of the same cycle
    let report = report.unwrap();
    assert_eq!(report.batches, 2);
    assert_eq!(report.synced, 2);
    assert_eq!(harness.transport.calls()[1][0].operation.id, appended.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_offline_mid_cycle_abandons_then_reclaims() {
    let harness = Harness::new(EngineConfig::default()).await;
    let operation = harness.update("p1", json!({ "qty": 1 })).await;
    harness.transport.gate.armed.store(true, Ordering::SeqCst);
    let gate = harness.transport.gate.clone();

    let cycle = harness.engine.trigger_sync();
    let drop_link = async {
        gate.entered.notified().await;
        harness.engine.set_online(false);
    };
    let (report, ()) = tokio::join!(cycle, drop_link);
    harness.transport.gate.armed.store(false, Ordering::SeqCst);

    assert_eq!(report.unwrap().status, CycleStatus::Abandoned);
    let pending = harness.engine.pending_operations().await;
    assert_eq!(pending[0].event.status, SyncStatus::Syncing);
    assert!(!harness.engine.state().is_online);

    let report = harness.engine.trigger_sync().await.unwrap();
    assert_eq!(report.status, CycleStatus::Offline);

    harness.engine.set_online(true);
    let report = harness.engine.trigger_sync().await.unwrap();
    assert_eq!(report.batches, 0);

    harness.clock.advance(120_000);
    let report = harness.engine.trigger_sync().await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.synced, 1);

    let calls = harness.transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1][0].operation.id, operation.id);
    assert_eq!(calls[1][0].attempt, 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_transmit_timeout_fails_batch_and_backs_off() {
    let harness = Harness::new(EngineConfig::default()).await;
    let operation = harness.update("p1", json!({ "qty": 1 })).await;
    harness.transport.gate.armed.store(true, Ordering::SeqCst);

    let report = harness.engine.run_cycle(Trigger::Interval).await.unwrap();
    assert_eq!(report.status, CycleStatus::TransportFailed);
    assert_eq!(
        harness.engine.phase().await,
        SchedulerPhase::Backoff { until: 2_000 }
    );

    let pending = harness.engine.pending_operations().await;
    assert_eq!(pending[0].operation.id, operation.id);
    assert_eq!(pending[0].event.status, SyncStatus::Failed);
    assert!(pending[0].event.retryable);

    // Periodic triggers wait out the window; explicit ones do not
    let report = harness.engine.run_cycle(Trigger::Interval).await.unwrap();
    assert_eq!(report.status, CycleStatus::Deferred);
    harness.transport.gate.armed.store(false, Ordering::SeqCst);
    harness.clock.set(2_000);
    let report = harness.engine.run_cycle(Trigger::Interval).await.unwrap();
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.synced, 1);
    assert_eq!(harness.engine.phase().await, SchedulerPhase::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batches_keep_causal_order_per_record() {
    let config = EngineConfig {
        batch_size: 2,
        ..EngineConfig::default()
    };
    let harness = Harness::new(config).await;
    harness
        .add(OperationType::Create, "p1", json!({ "qty": 1 }), Priority::Low)
        .await;
    harness
        .add(OperationType::Update, "p1", json!({ "qty": 2 }), Priority::Low)
        .await;
    harness
        .add(OperationType::Update, "p1", json!({ "qty": 3 }), Priority::Critical)
        .await;
    harness
        .add(OperationType::Create, "p2", json!({ "qty": 1 }), Priority::High)
        .await;

    let report = harness.engine.trigger_sync().await.unwrap();
    assert_eq!(report.batches, 2);

    let sent: Vec<Vec<(String, u64)>> = harness
        .transport
        .calls()
        .iter()
        .map(|batch| {
            batch
                .iter()
                .map(|o| (o.operation.entity_id.clone(), o.operation.version))
                .collect()
        })
        .collect();
    assert_eq!(
        sent,
        vec![
            vec![("p1".to_string(), 2), ("p1".to_string(), 3)],
            vec![("p1".to_string(), 4), ("p2".to_string(), 5)],
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_write_leaves_log_unchanged() {
    let harness = Harness::new(EngineConfig::default()).await;
    harness.store.fail_writes(true);

    let result = harness
        .engine
        .add_operation(
            OperationType::Update,
            "products",
            "p1",
            json!({ "qty": 1 }),
            Priority::Medium,
        )
        .await;
    assert!(matches!(result, Err(Error::Storage(_))));
    assert!(harness.engine.pending_operations().await.is_empty());
    assert_eq!(harness.engine.state().pending_operations, 0);

    harness.store.fail_writes(false);
    let operation = harness.update("p1", json!({ "qty": 1 })).await;
    assert_eq!(operation.version, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_operations_are_rejected() {
    let harness = Harness::new(EngineConfig::default()).await;
    let empty = harness
        .engine
        .add_operation(OperationType::Create, "", "p1", json!({}), Priority::Low)
        .await;
    let scalar = harness
        .engine
        .add_operation(OperationType::Update, "products", "p1", json!(7), Priority::Low)
        .await;

    assert!(matches!(empty, Err(Error::InvalidInput(_))));
    assert!(matches!(scalar, Err(Error::InvalidInput(_))));
    assert_eq!(harness.engine.state().pending_operations, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_update_discards_record_chain() {
    let harness = Harness::new(EngineConfig::default()).await;
    harness.update("p1", json!({ "qty": 1 })).await;
    harness.update("p1", json!({ "qty": 2 })).await;
    harness.transport.push(conflict_all(RemoteConflict {
        conflict_type: ConflictType::DeleteUpdate,
        remote: None,
        canonical_id: None,
    }));

    let report = harness.engine.trigger_sync().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.discarded, 2);
    assert!(harness.engine.pending_operations().await.is_empty());
    assert_eq!(
        harness.effects(),
        vec![LocalEffect::RemoveRecord {
            entity: "products".to_string(),
            entity_id: "p1".to_string(),
        }]
    );
    let conflicts = harness.engine.conflicts().await;
    assert_eq!(conflicts[0].resolution, Resolution::RemoteWins);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_last_write_wins_keeps_newer_local_write() {
    let config = EngineConfig::default().with_conflict_strategy(ConflictStrategy::LastWriteWins);
    let harness = Harness::new(config).await;
    harness.clock.set(5_000);
    harness.update("p1", json!({ "qty": 5 })).await;
    let remote = remote_update(json!({ "qty": 9 }), clock_of(&[("A", 1), ("B", 2)]), 4_000);
    harness.transport.push(conflict_all(concurrent_update(remote)));

    let report = harness.engine.trigger_sync().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.synced, 1);
    let calls = harness.transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1][0].operation.data, json!({ "qty": 5 }));
    assert!(harness.effects().is_empty());
    assert_eq!(
        harness.engine.conflicts().await[0].resolution,
        Resolution::LocalWins
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_last_write_wins_applies_newer_remote_write() {
    let config = EngineConfig::default().with_conflict_strategy(ConflictStrategy::LastWriteWins);
    let harness = Harness::new(config).await;
    harness.clock.set(5_000);
    harness.update("p1", json!({ "qty": 5 })).await;
    let remote = remote_update(json!({ "qty": 9 }), clock_of(&[("A", 1), ("B", 2)]), 6_000);
    harness.transport.push(conflict_all(concurrent_update(remote)));

    let report = harness.engine.trigger_sync().await.unwrap();

    assert_eq!(report.discarded, 1);
    assert_eq!(harness.transport.call_count(), 1);
    assert_eq!(
        harness.effects(),
        vec![LocalEffect::ApplyRemote {
            entity: "products".to_string(),
            entity_id: "p1".to_string(),
            data: json!({ "qty": 9 }),
        }]
    );
    // The remote write is now part of the device's causal history
    let next = harness.update("p1", json!({ "qty": 1 })).await;
    assert_eq!(next.vector_clock.get("B"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rebase_resends_accepted_later_write_after_it() {
    let config = EngineConfig::default().with_conflict_strategy(ConflictStrategy::LastWriteWins);
    let harness = Harness::new(config).await;
    harness.clock.set(5_000);
    let first = harness.update("p1", json!({ "qty": 5 })).await;
    let second = harness.update("p1", json!({ "qty": 6 })).await;
    let remote = remote_update(json!({ "qty": 9 }), clock_of(&[("A", 1), ("B", 2)]), 4_000);
    harness.transport.push(Box::new(move |batch| {
        Ok(BatchResult::new(
            batch
                .iter()
                .map(|outbound| {
                    let id = outbound.operation.id;
                    if id == first.id {
                        OperationOutcome::conflict(id, concurrent_update(remote.clone()))
                    } else {
                        let clock = outbound.operation.vector_clock.clone();
                        OperationOutcome::accepted(id, Some(clock))
                    }
                })
                .collect(),
        ))
    }));

    let report = harness.engine.trigger_sync().await.unwrap();

    assert_eq!(report.conflicts, 1);
    let calls = harness.transport.calls();
    assert_eq!(calls.len(), 2);
    let resent: Vec<(u64, Value)> = calls[1]
        .iter()
        .map(|outbound| (outbound.operation.version, outbound.operation.data.clone()))
        .collect();
    assert_eq!(
        resent,
        vec![
            (second.version + 1, json!({ "qty": 5 })),
            (second.version + 2, json!({ "qty": 6 })),
        ]
    );
    assert_eq!(harness.engine.state().pending_operations, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_create_remaps_later_operations() {
    let harness = Harness::new(EngineConfig::default()).await;
    harness
        .add(OperationType::Create, "p1", json!({ "sku": "V-1" }), Priority::Medium)
        .await;
    harness.update("p1", json!({ "qty": 3 })).await;
    harness.transport.push(conflict_all(RemoteConflict {
        conflict_type: ConflictType::CreateDuplicate,
        remote: None,
        canonical_id: Some("srv-9".to_string()),
    }));

    let report = harness.engine.trigger_sync().await.unwrap();

    assert_eq!(report.conflicts, 1);
    let calls = harness.transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].len(), 1);
    assert_eq!(calls[1][0].operation.entity_id, "srv-9");
    assert_eq!(calls[1][0].operation.op_type, OperationType::Update);
    assert_eq!(
        harness.effects(),
        vec![LocalEffect::RemapId {
            entity: "products".to_string(),
            from: "p1".to_string(),
            to: "srv-9".to_string(),
        }]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manual_remote_wins_applies_remote_data() {
    let harness = Harness::new(EngineConfig::default()).await;
    let local = harness.update("p1", json!({ "qty": 5 })).await;
    let remote = remote_update(json!({ "qty": 9 }), clock_of(&[("A", 1), ("B", 2)]), 900);
    harness.transport.push(conflict_all(concurrent_update(remote)));
    harness.engine.trigger_sync().await.unwrap();

    harness
        .engine
        .resolve_conflict_manually(local.id, Resolution::RemoteWins)
        .await
        .unwrap();

    assert!(harness.engine.pending_operations().await.is_empty());
    assert_eq!(
        harness.effects(),
        vec![LocalEffect::ApplyRemote {
            entity: "products".to_string(),
            entity_id: "p1".to_string(),
            data: json!({ "qty": 9 }),
        }]
    );
    let again = harness
        .engine
        .resolve_conflict_manually(local.id, Resolution::LocalWins)
        .await;
    assert!(again.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_operation_can_be_retried_or_dismissed() {
    let harness = Harness::new(EngineConfig::default()).await;
    let first = harness.update("p1", json!({ "qty": -1 })).await;
    let second = harness.update("p2", json!({ "qty": -2 })).await;
    harness.transport.push(Box::new(|batch| {
        Ok(BatchResult::new(
            batch
                .iter()
                .map(|o| OperationOutcome::rejected(o.operation.id, "qty must be positive"))
                .collect(),
        ))
    }));

    let report = harness.engine.trigger_sync().await.unwrap();
    assert_eq!(report.failed, 2);
    let state = harness.engine.state();
    assert_eq!(state.failed_operations.len(), 2);
    assert_eq!(state.pending_operations, 0);

    // Rejections are not retried automatically
    harness.clock.advance(600_000);
    harness.engine.trigger_sync().await.unwrap();
    assert_eq!(harness.transport.call_count(), 1);

    harness.engine.dismiss_failed(first.id).await.unwrap();
    harness.engine.retry_failed(second.id).await.unwrap();
    assert_eq!(harness.engine.state().failed_operations.len(), 0);
    assert_eq!(harness.engine.state().pending_operations, 1);

    let report = harness.engine.trigger_sync().await.unwrap();
    assert_eq!(report.synced, 1);
    assert!(harness.engine.pending_operations().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dismiss_requires_permanent_failure() {
    let harness = Harness::new(EngineConfig::default()).await;
    let operation = harness.update("p1", json!({ "qty": 1 })).await;

    let result = harness.engine.dismiss_failed(operation.id).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
    assert_eq!(harness.engine.state().pending_operations, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_recovers_log_and_device() {
    let store = MemoryStore::new();
    let first = Harness::with_store(store.clone(), EngineConfig::default()).await;
    let device = first.engine.device_id().clone();
    first.update("p1", json!({ "qty": 1 })).await;
    first.update("p2", json!({ "qty": 2 })).await;
    drop(first);

    let second = Harness::with_store(store, EngineConfig::default()).await;
    assert_eq!(second.engine.device_id(), &device);
    assert_eq!(second.engine.state().pending_operations, 2);
    let next = second.update("p3", json!({ "qty": 3 })).await;
    assert_eq!(next.version, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_libsql_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fieldsync.db");

    let store = LibSqlStore::open_path(&path).await.unwrap();
    let engine = SyncEngine::open(
        store,
        ScriptedTransport::default(),
        Arc::new(ManualClock::new(1_000)),
        EngineConfig::default().without_auto_sync(),
    )
    .await
    .unwrap();
    let appended = engine
        .add_operation(
            OperationType::Create,
            "inspections",
            "i1",
            json!({ "site": "North" }),
            Priority::Critical,
        )
        .await
        .unwrap();
    drop(engine);

    let store = LibSqlStore::open_path(&path).await.unwrap();
    let transport = ScriptedTransport::default();
    let engine = SyncEngine::open(
        store,
        transport.clone(),
        Arc::new(ManualClock::new(2_000)),
        EngineConfig::default().without_auto_sync(),
    )
    .await
    .unwrap();
    let pending = engine.pending_operations().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(Some(&pending[0].operation), appended.operation());
    assert_eq!(pending[0].event.priority, Priority::Critical);

    engine.trigger_sync().await.unwrap();
    assert_eq!(engine.state().pending_operations, 0);
    assert_eq!(transport.call_count(), 1);
}

/// Authority that applies operations to shared records.
///
/// An update whose clock does not dominate the record's clock is reported
/// as a concurrent update carrying the last applied change.
#[derive(Clone, Default)]
struct InMemoryRemote {
    records: Arc<Mutex<BTreeMap<String, RemoteRecord>>>,
    applied: Arc<Mutex<BTreeSet<(String, String, u64)>>>,
}

#[derive(Clone)]
struct RemoteRecord {
    data: Value,
    last: RemoteOperation,
}

impl InMemoryRemote {
    fn seed(&self, entity_id: &str, data: Value, clock: VectorClock) {
        let last = RemoteOperation {
            op_type: Some(OperationType::Create),
            data: data.clone(),
            version: 1,
            timestamp: 0,
            device_id: Some("A".to_string()),
            vector_clock: clock,
        };
        self.records
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), RemoteRecord { data, last });
    }

    fn record(&self, entity_id: &str) -> Option<Value> {
        self.records
            .lock()
            .unwrap()
            .get(entity_id)
            .map(|record| record.data.clone())
    }

    fn apply(&self, operation: &CrdtOperation) -> OperationOutcome {
        let key = (
            operation.entity_id.clone(),
            operation.device_id.to_string(),
            operation.version,
        );
        let mut records = self.records.lock().unwrap();
        if self.applied.lock().unwrap().contains(&key) {
            let clock = records
                .get(&operation.entity_id)
                .map(|record| record.last.vector_clock.clone());
            return OperationOutcome::accepted(operation.id, clock);
        }

        if let Some(record) = records.get(&operation.entity_id) {
            let ordering = operation.vector_clock.compare(&record.last.vector_clock);
            if operation.op_type == OperationType::Update
                && !matches!(ordering, ClockOrdering::After | ClockOrdering::Equal)
            {
                return OperationOutcome::conflict(
                    operation.id,
                    concurrent_update(record.last.clone()),
                );
            }
        }

        let previous = records
            .get(&operation.entity_id)
            .map(|record| record.last.vector_clock.clone())
            .unwrap_or_default();
        let mut data = records
            .get(&operation.entity_id)
            .map_or_else(|| json!({}), |record| record.data.clone());
        if let (Some(target), Some(fields)) = (data.as_object_mut(), operation.data.as_object()) {
            for (field, value) in fields {
                target.insert(field.clone(), value.clone());
            }
        }
        let clock = previous.merged(&operation.vector_clock);
        records.insert(
            operation.entity_id.clone(),
            RemoteRecord {
                data,
                last: RemoteOperation {
                    op_type: Some(operation.op_type),
                    data: operation.data.clone(),
                    version: operation.version,
                    timestamp: operation.timestamp,
                    device_id: Some(operation.device_id.to_string()),
                    vector_clock: clock.clone(),
                },
            },
        );
        self.applied.lock().unwrap().insert(key);
        OperationOutcome::accepted(operation.id, Some(clock))
    }
}

impl Transport for InMemoryRemote {
    async fn send(&self, batch: &[OutboundOperation]) -> SendResult {
        Ok(BatchResult::new(
            batch
                .iter()
                .map(|outbound| self.apply(&outbound.operation))
                .collect(),
        ))
    }
}

async fn device(name: &str, remote: &InMemoryRemote) -> SyncEngine<MemoryStore, InMemoryRemote> {
    let store = MemoryStore::new();
    seed_device(&store, name, clock_of(&[("A", 1)])).await;
    SyncEngine::open(
        store,
        remote.clone(),
        Arc::new(ManualClock::new(1_000)),
        EngineConfig::default().without_auto_sync(),
    )
    .await
    .unwrap()
}

async fn converge(a_first: bool) -> Value {
    let remote = InMemoryRemote::default();
    remote.seed(
        "p1",
        json!({ "qty": 1, "note": "" }),
        clock_of(&[("A", 1)]),
    );
    let a = device("A", &remote).await;
    let b = device("B", &remote).await;

    a.add_operation(
        OperationType::Update,
        "products",
        "p1",
        json!({ "qty": 5 }),
        Priority::Medium,
    )
    .await
    .unwrap();
    b.add_operation(
        OperationType::Update,
        "products",
        "p1",
        json!({ "note": "checked" }),
        Priority::Medium,
    )
    .await
    .unwrap();

    if a_first {
        a.trigger_sync().await.unwrap();
        b.trigger_sync().await.unwrap();
    } else {
        b.trigger_sync().await.unwrap();
        a.trigger_sync().await.unwrap();
    }

    assert_eq!(a.state().pending_operations, 0);
    assert_eq!(b.state().pending_operations, 0);
    assert!(a.state().open_conflicts().next().is_none());
    assert!(b.state().open_conflicts().next().is_none());
    remote.record("p1").unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disjoint_concurrent_updates_converge_in_either_order() {
    let a_first = converge(true).await;
    let b_first = converge(false).await;

    assert_eq!(a_first, json!({ "qty": 5, "note": "checked" }));
    assert_eq!(b_first, a_first);
}
