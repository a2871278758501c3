//! fieldsync-core - Offline-first synchronization engine
//!
//! Local mutations are appended to a durable operation log, projected into a
//! priority-ordered sync queue, and pushed to a central authority by a
//! single-flight scheduler. Conflicts are detected with per-device vector
//! clocks and resolved automatically or held for manual resolution.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod env;
pub mod error;
pub mod models;
pub mod oplog;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod transport;

pub use clock::{ClockOrdering, VectorClock};
pub use config::EngineConfig;
pub use engine::{CycleReport, CycleStatus, QueuedOperation, SyncEngine};
pub use env::{Clock, Connectivity, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use models::{
    ConflictResolution, ConflictType, CrdtOperation, DeviceId, LocalEffect, OfflineState,
    OperationId, OperationType, Priority, Resolution, SyncEvent, SyncStatus,
};
pub use oplog::AppendOutcome;
pub use scheduler::{Scheduler, SchedulerPhase, Trigger};
pub use storage::{KeyValueStore, LibSqlStore, MemoryStore};
pub use transport::{HttpTransport, Transport, TransportError};
