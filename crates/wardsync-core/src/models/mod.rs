//! Data models for wardsync

mod change;
mod device;
mod lookup;
mod record;
mod session;
mod tick;

pub use change::{ChangeEvent, ChangeKind};
pub use device::{QueueStatus, SyncQueuedDevice};
pub use lookup::SyncLookupEntry;
pub use record::{new_record_id, SyncableRecord};
pub use session::{
    Direction, SessionId, SessionParameters, SessionStatus, SessionSyncRecord, SyncSession,
};
pub use tick::SyncTick;
