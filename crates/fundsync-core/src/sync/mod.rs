//! Offline transaction sync engine

mod conflict;
mod idempotency;
mod planner;
mod reconciler;
mod resolver;
mod service;
mod session_log;

pub use conflict::{ConflictDetector, Verdict};
pub use idempotency::{lookup as lookup_idempotency_key, IdempotencyOutcome};
pub use planner::{FullSyncPlan, FullSyncPlanner, FullSyncRequest};
pub use reconciler::{
    run_batch, BatchOutcome, ReconcileScope, Reconciler, RecordOutcome, RecordResult,
};
pub use resolver::{resolve_all, ConflictResolver, ResolutionOutcome, ResolutionStatus};
pub use service::{
    ClearReport, LastSync, PullReport, PullRequest, PushReport, PushRequest, SyncService,
    SyncStatus, DEFAULT_MAX_BATCH_SIZE,
};
pub use session_log::SessionLog;
