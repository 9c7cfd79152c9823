//! Data models for fundsync

mod entity;
mod offline;
mod resolution;
mod session;
mod settings;
mod transaction;

pub use entity::{DeletedEntity, EntityKind, ReferenceState, ReferenceStatus};
pub use offline::{ConflictDetail, ConflictReason, OfflineStatus, PendingOfflineRecord, ServerState};
pub use resolution::{ConflictResolution, MergeFields};
pub use session::{
    SessionId, SessionStatus, SessionSummary, SyncCheckpoint, SyncKind, SyncSession,
};
pub use settings::{BatchMode, UserSyncSettings};
pub use transaction::{OfflineTransaction, TransactionPayload, TransactionType};
