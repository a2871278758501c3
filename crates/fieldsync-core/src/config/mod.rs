//! Engine configuration.
//!
//! `EngineConfig` is read from JSON by clients; every field has a default so
//! partial documents are accepted.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 300_000;
const DEFAULT_SYNC_INTERVAL_MS: u64 = 60_000;
const DEFAULT_TRANSMIT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SYNCING_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MAX_BATCHES_PER_CYCLE: usize = 20;

/// Strategy for concurrent updates touching the same fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Higher device timestamp wins. Device clocks drift, so this is a
    /// heuristic, not an ordering guarantee.
    LastWriteWins,
    /// Hold the entity until the application resolves the conflict
    #[default]
    Manual,
}

/// Strategy for a local update on a record deleted remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteUpdateStrategy {
    #[default]
    RemoteWins,
    Manual,
}

/// Tunables for the operation log, sync queue, scheduler and resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on operations per transmitted batch
    pub batch_size: usize,
    /// Retries allowed before a failed operation becomes permanent
    pub max_retries: u32,
    /// Base retry delay; doubled per retry
    pub retry_delay_ms: u64,
    /// Backoff ceiling
    pub max_retry_delay_ms: u64,
    /// Periodic sync interval; `None` disables the timer
    pub sync_interval_ms: Option<u64>,
    /// Timeout applied to each batch transmission
    pub transmit_timeout_ms: u64,
    /// A `syncing` event older than this at cycle start is abandoned
    pub syncing_timeout_ms: u64,
    /// Bound on batch pulls within one cycle
    pub max_batches_per_cycle: usize,
    pub conflict_strategy: ConflictStrategy,
    pub delete_update_strategy: DeleteUpdateStrategy,
    /// Entity name -> payload field holding its business key
    pub business_keys: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            sync_interval_ms: Some(DEFAULT_SYNC_INTERVAL_MS),
            transmit_timeout_ms: DEFAULT_TRANSMIT_TIMEOUT_MS,
            syncing_timeout_ms: DEFAULT_SYNCING_TIMEOUT_MS,
            max_batches_per_cycle: DEFAULT_MAX_BATCHES_PER_CYCLE,
            conflict_strategy: ConflictStrategy::default(),
            delete_update_strategy: DeleteUpdateStrategy::default(),
            business_keys: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a config document from JSON
    pub fn from_json(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)
            .map_err(|error| Error::Config(format!("invalid engine config JSON: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.retry_delay_ms == 0 {
            return Err(Error::Config(
                "retry_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(Error::Config(format!(
                "max_retry_delay_ms ({}) must not be below retry_delay_ms ({})",
                self.max_retry_delay_ms, self.retry_delay_ms
            )));
        }
        if self.transmit_timeout_ms == 0 {
            return Err(Error::Config(
                "transmit_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_batches_per_cycle == 0 {
            return Err(Error::Config(
                "max_batches_per_cycle must be at least 1".to_string(),
            ));
        }
        if self.sync_interval_ms == Some(0) {
            return Err(Error::Config(
                "sync_interval_ms must be greater than 0 (omit it to disable)".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the periodic sync interval
    #[must_use]
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = Some(u64::try_from(interval.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Disable periodic sync (manual and connectivity triggers only)
    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.sync_interval_ms = None;
        self
    }

    #[must_use]
    pub const fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_ms.map(Duration::from_millis)
    }

    pub const fn transmit_timeout(&self) -> Duration {
        Duration::from_millis(self.transmit_timeout_ms)
    }
}
