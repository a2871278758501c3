//! Data models for fieldsync

mod conflict;
mod effect;
mod offline_state;
mod operation;
mod sync_event;

pub use conflict::{ConflictResolution, ConflictType, RemoteOperation, Resolution};
pub use effect::LocalEffect;
pub use offline_state::{FailedOperation, OfflineState};
pub use operation::{new_entity_id, CrdtOperation, DeviceId, EntityRef, OperationId, OperationType};
pub use sync_event::{Priority, SyncEvent, SyncStatus};
