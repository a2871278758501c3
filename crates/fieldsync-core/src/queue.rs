//! Priority-ordered, retry-aware projection of the operation log.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::models::{EntityRef, OperationId, Priority, SyncEvent, SyncStatus};
use crate::oplog::OperationLog;
use crate::storage::KeyValueStore;

/// Queue tunables, taken from [`EngineConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub syncing_timeout_ms: u64,
}

impl From<&EngineConfig> for QueueConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            max_retry_delay_ms: config.max_retry_delay_ms,
            syncing_timeout_ms: config.syncing_timeout_ms,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Decides what to send next and when failed work comes back
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncQueue {
    config: QueueConfig,
}

struct Candidate {
    id: OperationId,
    priority: Priority,
    version: u64,
    timestamp: i64,
}

fn millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

impl SyncQueue {
    pub const fn new(config: QueueConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Next batch to transmit, in transmission order.
    ///
    /// Per record only the leading run of `pending` operations is eligible,
    /// so an operation never leaves while an earlier version of the same
    /// record is failed, in flight or held. Each candidate inherits the
    /// highest priority among the later candidates of its record; sorting
    /// on that keeps every prerequisite ahead of its dependants, and
    /// truncation never splits a record's run out of order.
    pub fn next_batch(
        &self,
        log: &OperationLog,
        blocked: &BTreeSet<EntityRef>,
    ) -> Vec<OperationId> {
        let mut records: BTreeMap<EntityRef, Vec<(u64, OperationId)>> = BTreeMap::new();
        for (operation, _) in log.entries() {
            records
                .entry(operation.entity_ref())
                .or_default()
                .push((operation.version, operation.id));
        }

        let mut candidates = Vec::new();
        for (record, mut chain) in records {
            if blocked.contains(&record) {
                continue;
            }
            chain.sort_unstable();

            let mut run = Vec::new();
            for (_, id) in chain {
                let (Some(operation), Some(event)) = (log.operation(id), log.event(id)) else {
                    break;
                };
                if event.status != SyncStatus::Pending {
                    break;
                }
                run.push(Candidate {
                    id,
                    priority: event.priority,
                    version: operation.version,
                    timestamp: operation.timestamp,
                });
            }

            let mut inherited = Priority::Low;
            for candidate in run.iter_mut().rev() {
                inherited = inherited.max(candidate.priority);
                candidate.priority = inherited;
            }
            candidates.extend(run);
        }

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.version.cmp(&b.version))
                .then(a.timestamp.cmp(&b.timestamp))
                .then(a.id.cmp(&b.id))
        });
        candidates.truncate(self.config.batch_size);
        candidates.into_iter().map(|candidate| candidate.id).collect()
    }

    /// `retry_delay_ms * 2^retry_count`, capped at `max_retry_delay_ms`
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
        let delay = self
            .config
            .retry_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_retry_delay_ms);
        Duration::from_millis(delay)
    }

    /// When a failed event becomes eligible for requeue; `None` if never
    pub fn retry_due_at(&self, event: &SyncEvent) -> Option<i64> {
        if event.status != SyncStatus::Failed || event.is_exhausted(self.config.max_retries) {
            return None;
        }
        let last = event.last_retry.unwrap_or(i64::MIN);
        Some(last.saturating_add(millis(self.backoff_delay(event.retry_count))))
    }

    /// Flip failed events whose backoff has elapsed back to `pending`
    pub async fn requeue_failed<S: KeyValueStore>(
        &self,
        store: &S,
        log: &mut OperationLog,
        now: i64,
    ) -> Result<Vec<OperationId>> {
        let due: Vec<OperationId> = log
            .by_status(SyncStatus::Failed)
            .into_iter()
            .filter(|(_, event)| self.retry_due_at(event).is_some_and(|at| at <= now))
            .map(|(operation, _)| operation.id)
            .collect();

        for id in &due {
            log.requeue(store, *id).await?;
            if let Some(event) = log.event(*id) {
                tracing::info!(
                    "Requeued operation {id} (retry {}/{})",
                    event.retry_count,
                    self.config.max_retries
                );
            }
        }
        Ok(due)
    }

    /// Return events stuck in `syncing` past the timeout to `pending`
    pub async fn reclaim_abandoned<S: KeyValueStore>(
        &self,
        store: &S,
        log: &mut OperationLog,
        now: i64,
    ) -> Result<Vec<OperationId>> {
        let timeout = i64::try_from(self.config.syncing_timeout_ms).unwrap_or(i64::MAX);
        let abandoned: Vec<OperationId> = log
            .by_status(SyncStatus::Syncing)
            .into_iter()
            .filter(|(_, event)| {
                event
                    .syncing_since
                    .is_none_or(|since| now.saturating_sub(since) >= timeout)
            })
            .map(|(operation, _)| operation.id)
            .collect();

        if !abandoned.is_empty() {
            tracing::warn!(
                "Reclaiming {} operations abandoned in flight",
                abandoned.len()
            );
            log.reset_to_pending(store, &abandoned).await?;
        }
        Ok(abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationType;
    use crate::oplog::{AppendOutcome, OperationDraft};
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn open(store: &MemoryStore) -> OperationLog {
        OperationLog::load(store, BTreeMap::new()).await.unwrap()
    }

    async fn push(
        store: &MemoryStore,
        log: &mut OperationLog,
        op_type: OperationType,
        entity_id: &str,
        priority: Priority,
        now: i64,
    ) -> OperationId {
        let draft = OperationDraft::new(op_type, "products", entity_id, json!({ "qty": now }))
            .with_priority(priority);
        match log.append(store, draft, now).await.unwrap() {
            AppendOutcome::Appended(operation) => operation.id,
            AppendOutcome::Collapsed { .. } => panic!("unexpected collapse"),
        }
    }

    fn queue(batch_size: usize) -> SyncQueue {
        SyncQueue::new(QueueConfig {
            batch_size,
            ..QueueConfig::default()
        })
    }

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let queue = SyncQueue::new(QueueConfig {
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 5_000,
            ..QueueConfig::default()
        });
        let delays: Vec<u64> = (0..5)
            .map(|count| u64::try_from(queue.backoff_delay(count).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
        assert_eq!(queue.backoff_delay(200), Duration::from_millis(5_000));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_priority_then_version_order() {
        let store = MemoryStore::new();
        let mut log = open(&store).await;
        let low = push(&store, &mut log, OperationType::Create, "p1", Priority::Low, 1).await;
        let critical =
            push(&store, &mut log, OperationType::Create, "p2", Priority::Critical, 2).await;
        let medium = push(&store, &mut log, OperationType::Create, "p3", Priority::Medium, 3).await;

        let batch = queue(10).next_batch(&log, &BTreeSet::new());
        assert_eq!(batch, vec![critical, medium, low]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_causal_order_survives_priority_and_truncation() {
        let store = MemoryStore::new();
        let mut log = open(&store).await;
        let a = push(&store, &mut log, OperationType::Create, "p1", Priority::Low, 1).await;
        let other = push(&store, &mut log, OperationType::Create, "p2", Priority::High, 2).await;
        let b = push(&store, &mut log, OperationType::Update, "p1", Priority::Critical, 3).await;

        let queue = queue(2);
        let first = queue.next_batch(&log, &BTreeSet::new());
        assert_eq!(first, vec![a, b]);

        log.mark_syncing(&store, &first, 10).await.unwrap();
        let second = queue.next_batch(&log, &BTreeSet::new());
        assert_eq!(second, vec![other]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_predecessor_holds_record() {
        let store = MemoryStore::new();
        let mut log = open(&store).await;
        let a = push(&store, &mut log, OperationType::Create, "p1", Priority::Medium, 1).await;
        let _b = push(&store, &mut log, OperationType::Update, "p1", Priority::High, 2).await;
        log.mark_syncing(&store, &[a], 3).await.unwrap();
        log.mark_failed(&store, a, "offline", true, 4).await.unwrap();

        assert!(queue(10).next_batch(&log, &BTreeSet::new()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocked_records_are_skipped() {
        let store = MemoryStore::new();
        let mut log = open(&store).await;
        let _held = push(&store, &mut log, OperationType::Update, "p1", Priority::High, 1).await;
        let free = push(&store, &mut log, OperationType::Update, "p2", Priority::Low, 2).await;

        let blocked = BTreeSet::from([EntityRef::new("products", "p1")]);
        assert_eq!(queue(10).next_batch(&log, &blocked), vec![free]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_requeue_follows_backoff_schedule() {
        let store = MemoryStore::new();
        let mut log = open(&store).await;
        let id = push(&store, &mut log, OperationType::Create, "p1", Priority::High, 0).await;
        let queue = SyncQueue::new(QueueConfig {
            max_retries: 3,
            retry_delay_ms: 1_000,
            ..QueueConfig::default()
        });

        let mut now = 0;
        let mut retry_times = Vec::new();
        loop {
            log.mark_syncing(&store, &[id], now).await.unwrap();
            log.mark_failed(&store, id, "unreachable", true, now)
                .await
                .unwrap();
            let Some(due) = queue.retry_due_at(log.event(id).unwrap()) else {
                break;
            };
            assert!(queue
                .requeue_failed(&store, &mut log, due - 1)
                .await
                .unwrap()
                .is_empty());
            assert_eq!(queue.requeue_failed(&store, &mut log, due).await.unwrap(), vec![id]);
            retry_times.push(due - now);
            now = due;
        }

        assert_eq!(retry_times, vec![1_000, 2_000, 4_000]);
        let event = log.event(id).unwrap();
        assert_eq!(event.retry_count, 3);
        assert!(event.is_exhausted(3));
        assert!(queue
            .requeue_failed(&store, &mut log, i64::MAX)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_retryable_failures_stay_failed() {
        let store = MemoryStore::new();
        let mut log = open(&store).await;
        let id = push(&store, &mut log, OperationType::Create, "p1", Priority::High, 0).await;
        log.mark_failed(&store, id, "invalid sku", false, 0)
            .await
            .unwrap();

        let requeued = queue(10)
            .requeue_failed(&store, &mut log, 1_000_000)
            .await
            .unwrap();
        assert!(requeued.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reclaim_abandoned_after_timeout() {
        let store = MemoryStore::new();
        let mut log = open(&store).await;
        let id = push(&store, &mut log, OperationType::Create, "p1", Priority::High, 0).await;
        log.mark_syncing(&store, &[id], 1_000).await.unwrap();
        let queue = SyncQueue::new(QueueConfig {
            syncing_timeout_ms: 5_000,
            ..QueueConfig::default()
        });

        assert!(queue
            .reclaim_abandoned(&store, &mut log, 5_999)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            queue.reclaim_abandoned(&store, &mut log, 6_000).await.unwrap(),
            vec![id]
        );
        assert_eq!(log.event(id).unwrap().status, SyncStatus::Pending);
    }
}
