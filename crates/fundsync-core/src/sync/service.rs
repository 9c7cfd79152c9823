//! Sync service: the facade the HTTP layer calls
//!
//! Writes take the database lock for their whole duration. Calls that sync
//! open a session first and always close it before returning. Status, conflict
//! and checkpoint reads go through a separate read-only connection, so they
//! answer while a sync is in flight.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::planner::{FullSyncPlan, FullSyncPlanner, FullSyncRequest};
use super::reconciler::{run_batch, BatchOutcome, ReconcileScope};
use super::resolver::{resolve_all, ResolutionOutcome};
use super::session_log::SessionLog;
use crate::db::{
    Database, OfflineCounts, OfflineRecordRepository, SessionRepository, SettingsRepository,
    SqliteOfflineRecordRepository, SqliteSessionRepository, SqliteSettingsRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    BatchMode, ConflictResolution, EntityKind, OfflineStatus, OfflineTransaction,
    PendingOfflineRecord, SessionId, SessionSummary, SyncKind, SyncSession, UserSyncSettings,
};
use crate::util::{millis_to_datetime, normalize_text_option, now_millis, user_fingerprint};

/// Largest batch accepted when no limit is configured
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Longest accepted device id
const MAX_DEVICE_ID_LEN: usize = 128;

/// Sessions listed by the status call
const RECENT_SESSIONS: usize = 5;

/// Batch of offline transactions pushed by a device
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PushRequest {
    pub device_id: String,
    pub transactions: Vec<OfflineTransaction>,
    /// Apply ownership conflicts in the client's favor
    #[serde(default)]
    pub force: bool,
    /// Roll back the whole batch on any record failure
    #[serde(default)]
    pub atomic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub session_id: SessionId,
    pub batch_mode: BatchMode,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

/// Pull request from a device
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PullRequest {
    pub device_id: String,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    /// Entity kinds to pull; all when absent or empty
    #[serde(default)]
    pub include: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullReport {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub plan: FullSyncPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_sync: Option<SyncSession>,
    pub pending: u64,
    pub conflicts: u64,
    pub synced: u64,
    pub recent_sessions: Vec<SyncSession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastSync {
    pub device_id: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub session_id: Option<SessionId>,
}

/// Rows removed by a clear
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub offline_records: usize,
    pub sessions: usize,
    pub checkpoints: usize,
}

/// Orchestrates sync calls over a shared database handle
#[derive(Clone)]
pub struct SyncService {
    db: Arc<Mutex<Database>>,
    reader: Arc<Mutex<Connection>>,
    max_batch_size: usize,
}

impl SyncService {
    /// Wrap `db`, failing any session a previous process left `started`.
    pub fn new(db: Database, max_batch_size: usize) -> Result<Self> {
        SessionLog::new(db.connection()).recover_interrupted()?;
        let reader = db.open_reader()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            reader: Arc::new(Mutex::new(reader)),
            max_batch_size: max_batch_size.max(1),
        })
    }

    pub const fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub async fn settings(&self, user_id: &str) -> Result<UserSyncSettings> {
        let reader = self.reader.lock().await;
        SqliteSettingsRepository::new(&reader).load(user_id)
    }

    pub async fn update_settings(
        &self,
        user_id: &str,
        settings: UserSyncSettings,
    ) -> Result<UserSyncSettings> {
        let db = self.db.lock().await;
        SqliteSettingsRepository::new(db.connection()).save(user_id, &settings)?;
        tracing::info!(
            user = user_fingerprint(user_id),
            batch_mode = settings.batch_mode.as_str(),
            "Updated sync settings"
        );
        Ok(settings)
    }

    pub async fn status(&self, user_id: &str) -> Result<SyncStatus> {
        let reader = self.reader.lock().await;
        let conn: &Connection = &reader;
        let log = SessionLog::new(conn);
        let OfflineCounts {
            pending,
            synced,
            conflicts,
        } = SqliteOfflineRecordRepository::new(conn).counts(user_id)?;

        Ok(SyncStatus {
            is_syncing: log.is_syncing(user_id)?,
            last_sync: log.last_completed(user_id, None)?,
            pending,
            conflicts,
            synced,
            recent_sessions: log.recent(user_id, RECENT_SESSIONS)?,
        })
    }

    /// Reconcile a pushed batch.
    ///
    /// Validation failures return before any session exists; in atomic mode
    /// that covers every record of the batch. Otherwise the
    /// session ends `completed` with per-record results, or `failed` when the
    /// batch as a whole errored.
    pub async fn sync_transactions(&self, user_id: &str, request: PushRequest) -> Result<PushReport> {
        let device_id = validate_device_id(&request.device_id)?;
        if request.transactions.is_empty() {
            return Err(Error::InvalidInput(
                "transactions must not be empty".to_string(),
            ));
        }
        if request.transactions.len() > self.max_batch_size {
            return Err(Error::InvalidInput(format!(
                "batch exceeds maximum of {} transactions",
                self.max_batch_size
            )));
        }

        let mut db = self.db.lock().await;
        let settings = SqliteSettingsRepository::new(db.connection()).load(user_id)?;
        let mode = if request.atomic {
            BatchMode::Atomic
        } else {
            settings.batch_mode
        };
        if mode == BatchMode::Atomic {
            for record in &request.transactions {
                record.validate()?;
            }
        }

        let mut metadata = Map::new();
        metadata.insert("requested".to_string(), request.transactions.len().into());
        metadata.insert("force".to_string(), Value::Bool(request.force));
        metadata.insert("batch_mode".to_string(), mode.as_str().into());
        let session_id = SessionLog::new(db.connection()).start(
            user_id,
            &device_id,
            SyncKind::Incremental,
            metadata,
        )?;

        let scope = ReconcileScope {
            user_id,
            device_id: &device_id,
            retain_synced: settings.retain_synced_records,
        };
        let result = push_batch(db.connection_mut(), scope, &session_id, &request, mode);
        let outcome = close_on_error(db.connection(), &session_id, result)?;

        tracing::info!(
            user = user_fingerprint(user_id),
            session_id = %session_id,
            batch_mode = mode.as_str(),
            synced = outcome.synced,
            conflicts = outcome.conflicts,
            errors = outcome.errors,
            "Processed offline transaction batch"
        );
        Ok(PushReport {
            session_id,
            batch_mode: mode,
            outcome,
        })
    }

    /// Plan a pull and record its checkpoint.
    pub async fn full_sync(&self, user_id: &str, request: PullRequest) -> Result<PullReport> {
        let device_id = validate_device_id(&request.device_id)?;
        let kinds = parse_include(request.include.as_deref())?;

        let mut db = self.db.lock().await;
        let settings = SqliteSettingsRepository::new(db.connection()).load(user_id)?;
        let plan_request = FullSyncRequest {
            last_sync: request.last_sync,
            kinds,
            window_months: settings.initial_transaction_window_months,
        };

        let mut metadata = Map::new();
        metadata.insert(
            "include".to_string(),
            plan_request
                .kinds
                .iter()
                .map(|kind| Value::from(kind.as_str()))
                .collect(),
        );
        metadata.insert(
            "last_sync".to_string(),
            plan_request
                .last_sync
                .map_or(Value::Null, |at| Value::from(at.to_rfc3339())),
        );
        let started_at = millis_to_datetime(now_millis());
        let session_id =
            SessionLog::new(db.connection()).start(user_id, &device_id, SyncKind::Full, metadata)?;

        let result = pull_plan(
            db.connection_mut(),
            user_id,
            &device_id,
            &session_id,
            &plan_request,
            started_at,
        );
        let plan = close_on_error(db.connection(), &session_id, result)?;

        tracing::info!(
            user = user_fingerprint(user_id),
            session_id = %session_id,
            kinds = plan.entities.len(),
            items = plan.item_count(),
            deleted = plan.deleted.len(),
            first_sync = plan_request.last_sync.is_none(),
            "Planned full sync"
        );
        Ok(PullReport { session_id, plan })
    }

    /// Offline records waiting for a resolution, oldest first.
    pub async fn conflicts(&self, user_id: &str) -> Result<Vec<PendingOfflineRecord>> {
        let reader = self.reader.lock().await;
        SqliteOfflineRecordRepository::new(&reader)
            .list_by_status(user_id, OfflineStatus::Conflict)
    }

    pub async fn resolve_conflicts(
        &self,
        user_id: &str,
        resolutions: &[ConflictResolution],
    ) -> Result<Vec<ResolutionOutcome>> {
        if resolutions.is_empty() {
            return Err(Error::InvalidInput(
                "resolutions must not be empty".to_string(),
            ));
        }
        if resolutions.len() > self.max_batch_size {
            return Err(Error::InvalidInput(format!(
                "batch exceeds maximum of {} resolutions",
                self.max_batch_size
            )));
        }

        let mut db = self.db.lock().await;
        let settings = SqliteSettingsRepository::new(db.connection()).load(user_id)?;
        let mut tx = db.connection_mut().transaction()?;
        let outcomes = resolve_all(
            &mut tx,
            user_id,
            settings.retain_synced_records,
            resolutions,
        )?;
        tx.commit()?;

        tracing::info!(
            user = user_fingerprint(user_id),
            requested = resolutions.len(),
            resolved = outcomes.iter().filter(|outcome| outcome.is_resolved()).count(),
            "Applied conflict resolutions"
        );
        Ok(outcomes)
    }

    /// When `device_id` last finished a sync.
    ///
    /// Reads the stored pull checkpoint, falling back to the device's most
    /// recent completed session.
    pub async fn last_sync(&self, user_id: &str, device_id: &str) -> Result<LastSync> {
        let device_id = validate_device_id(device_id)?;
        let reader = self.reader.lock().await;
        let conn: &Connection = &reader;

        if let Some(checkpoint) = SqliteSessionRepository::new(conn).checkpoint(user_id, &device_id)? {
            return Ok(LastSync {
                device_id,
                last_sync_at: Some(checkpoint.last_sync_at),
                session_id: Some(checkpoint.session_id),
            });
        }

        let session = SessionLog::new(conn).last_completed(user_id, Some(&device_id))?;
        Ok(LastSync {
            device_id,
            last_sync_at: session.as_ref().and_then(|session| session.completed_at),
            session_id: session.map(|session| session.id),
        })
    }

    /// Wipe the user's offline records, session history and checkpoints.
    pub async fn clear(&self, user_id: &str, confirm: bool) -> Result<ClearReport> {
        if !confirm {
            return Err(Error::InvalidInput(
                "clearing sync data requires \"confirm\": true".to_string(),
            ));
        }

        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let sessions = SqliteSessionRepository::new(&tx);
        let report = ClearReport {
            offline_records: SqliteOfflineRecordRepository::new(&tx).delete_all(user_id)?,
            sessions: sessions.delete_all(user_id)?,
            checkpoints: sessions.delete_checkpoints(user_id)?,
        };
        tx.commit()?;

        tracing::warn!(
            user = user_fingerprint(user_id),
            offline_records = report.offline_records,
            sessions = report.sessions,
            "Cleared sync data"
        );
        Ok(report)
    }
}

fn push_batch(
    conn: &mut Connection,
    scope: ReconcileScope<'_>,
    session_id: &SessionId,
    request: &PushRequest,
    mode: BatchMode,
) -> Result<BatchOutcome> {
    let mut tx = conn.transaction()?;
    let outcome = run_batch(&mut tx, scope, &request.transactions, request.force, mode)?;
    SessionLog::new(&tx).complete(session_id, &outcome.summary(mode, request.transactions.len()))?;
    tx.commit()?;
    Ok(outcome)
}

fn pull_plan(
    conn: &mut Connection,
    user_id: &str,
    device_id: &str,
    session_id: &SessionId,
    request: &FullSyncRequest,
    started_at: DateTime<Utc>,
) -> Result<FullSyncPlan> {
    let tx = conn.transaction()?;
    let plan = FullSyncPlanner::new(&tx).plan(user_id, request, started_at)?;

    let mut summary = SessionSummary {
        items_synced: u32::try_from(plan.item_count()).unwrap_or(u32::MAX),
        ..SessionSummary::default()
    };
    summary.metadata.insert(
        "checkpoint".to_string(),
        Value::from(plan.checkpoint.to_rfc3339()),
    );
    SessionLog::new(&tx).complete(session_id, &summary)?;
    SqliteSessionRepository::new(&tx).upsert_checkpoint(
        user_id,
        device_id,
        plan.checkpoint.timestamp_millis(),
        session_id,
    )?;
    tx.commit()?;
    Ok(plan)
}

/// Mark the session failed if `result` is an error, then hand `result` back.
fn close_on_error<T>(conn: &Connection, session_id: &SessionId, result: Result<T>) -> Result<T> {
    if let Err(error) = &result {
        tracing::error!(session_id = %session_id, %error, "Sync session failed");
        if let Err(fail_error) = SessionLog::new(conn).fail(session_id, &error.to_string()) {
            tracing::error!(session_id = %session_id, error = %fail_error, "Could not mark session failed");
        }
    }
    result
}

fn validate_device_id(device_id: &str) -> Result<String> {
    let device_id = normalize_text_option(Some(device_id.to_string()))
        .ok_or_else(|| Error::InvalidInput("device_id must not be empty".to_string()))?;
    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(Error::InvalidInput(format!(
            "device_id must be at most {MAX_DEVICE_ID_LEN} bytes"
        )));
    }
    Ok(device_id)
}

fn parse_include(include: Option<&[String]>) -> Result<BTreeSet<EntityKind>> {
    match include {
        None | Some([]) => Ok(EntityKind::ALL.into_iter().collect()),
        Some(kinds) => kinds.iter().map(|kind| kind.parse()).collect(),
    }
}
