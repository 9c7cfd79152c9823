//! Sync session log
//!
//! Every sync attempt opens a `started` session and closes it exactly once,
//! as `completed` or `failed`. Terminal transitions are guarded in SQL.

use chrono::Utc;
use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::db::{SessionRepository, SqliteSessionRepository};
use crate::error::Result;
use crate::models::{SessionId, SessionStatus, SessionSummary, SyncKind, SyncSession};
use crate::util::now_millis;

/// Audit trail of sync attempts, over `conn`
pub struct SessionLog<'a> {
    sessions: SqliteSessionRepository<'a>,
}

impl<'a> SessionLog<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self {
            sessions: SqliteSessionRepository::new(conn),
        }
    }

    /// Open a `started` session.
    pub fn start(
        &self,
        user_id: &str,
        device_id: &str,
        kind: SyncKind,
        metadata: Map<String, Value>,
    ) -> Result<SessionId> {
        let session = SyncSession {
            id: SessionId::new(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            kind,
            status: SessionStatus::Started,
            started_at: Utc::now(),
            completed_at: None,
            items_synced: 0,
            conflicts: 0,
            errors: 0,
            metadata: Value::Object(metadata),
            error_message: None,
        };
        self.sessions.insert(&session)?;
        tracing::debug!(session_id = %session.id, kind = kind.as_str(), "Sync session started");
        Ok(session.id)
    }

    /// Close a session as `completed`, merging `summary` into it.
    pub fn complete(&self, id: &SessionId, summary: &SessionSummary) -> Result<SyncSession> {
        self.sessions.complete(id, summary, now_millis())
    }

    /// Close a session as `failed`.
    pub fn fail(&self, id: &SessionId, message: &str) -> Result<SyncSession> {
        self.sessions.fail(id, message, now_millis())
    }

    /// Whether any of the user's sessions is still running.
    pub fn is_syncing(&self, user_id: &str) -> Result<bool> {
        self.sessions.any_started(user_id)
    }

    pub fn last_completed(
        &self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<Option<SyncSession>> {
        self.sessions.last_completed(user_id, device_id)
    }

    pub fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<SyncSession>> {
        self.sessions.recent(user_id, limit)
    }

    /// Fail sessions a previous process left running.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let failed = self
            .sessions
            .fail_all_started("interrupted before completion", now_millis())?;
        if failed > 0 {
            tracing::warn!(sessions = failed, "Marked interrupted sync sessions as failed");
        }
        Ok(failed)
    }
}
