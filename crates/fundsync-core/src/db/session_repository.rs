//! Sync session and checkpoint repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::models::{SessionId, SessionStatus, SessionSummary, SyncCheckpoint, SyncSession};
use crate::util::millis_to_datetime;

/// Trait for sync session storage operations
pub trait SessionRepository {
    /// Insert a freshly started session
    fn insert(&self, session: &SyncSession) -> Result<()>;

    /// Get a session by id
    fn get(&self, id: &SessionId) -> Result<Option<SyncSession>>;

    /// Move a `started` session to `completed`, merging the summary
    fn complete(
        &self,
        id: &SessionId,
        summary: &SessionSummary,
        completed_at: i64,
    ) -> Result<SyncSession>;

    /// Move a `started` session to `failed`
    fn fail(&self, id: &SessionId, message: &str, completed_at: i64) -> Result<SyncSession>;

    /// Whether the user has any session still `started`
    fn any_started(&self, user_id: &str) -> Result<bool>;

    /// Most recent completed session, optionally for one device
    fn last_completed(&self, user_id: &str, device_id: Option<&str>)
        -> Result<Option<SyncSession>>;

    /// Most recent sessions of any status, newest first
    fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<SyncSession>>;

    /// Fail every session left `started` (e.g. by a crash); returns how many
    fn fail_all_started(&self, message: &str, completed_at: i64) -> Result<usize>;

    /// Delete a user's session history
    fn delete_all(&self, user_id: &str) -> Result<usize>;

    /// Record the pull checkpoint for a device
    fn upsert_checkpoint(
        &self,
        user_id: &str,
        device_id: &str,
        last_sync_at: i64,
        session_id: &SessionId,
    ) -> Result<()>;

    /// Read the pull checkpoint for a device
    fn checkpoint(&self, user_id: &str, device_id: &str) -> Result<Option<SyncCheckpoint>>;

    /// Delete a user's checkpoints
    fn delete_checkpoints(&self, user_id: &str) -> Result<usize>;
}

/// `SQLite` implementation of `SessionRepository`
pub struct SqliteSessionRepository<'a> {
    conn: &'a Connection,
}

const SELECT_COLUMNS: &str = "id, user_id, device_id, kind, status, started_at, completed_at, \
     items_synced, conflicts, errors, metadata, error_message";

impl<'a> SqliteSessionRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_session(row: &Row<'_>) -> rusqlite::Result<SyncSession> {
        let id: String = row.get(0)?;
        let kind: String = row.get(3)?;
        let status: String = row.get(4)?;
        let metadata: String = row.get(10)?;
        Ok(SyncSession {
            id: id
                .parse()
                .map_err(|error| conversion_error(0, error))?,
            user_id: row.get(1)?,
            device_id: row.get(2)?,
            kind: kind.parse().map_err(|error| conversion_error(3, error))?,
            status: status.parse().map_err(|error| conversion_error(4, error))?,
            started_at: millis_to_datetime(row.get(5)?),
            completed_at: row.get::<_, Option<i64>>(6)?.map(millis_to_datetime),
            items_synced: row.get(7)?,
            conflicts: row.get(8)?,
            errors: row.get(9)?,
            metadata: serde_json::from_str(&metadata).map_err(|error| conversion_error(10, error))?,
            error_message: row.get(11)?,
        })
    }

    fn query_sessions(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<SyncSession>> {
        let mut stmt = self.conn.prepare(sql)?;
        let sessions = stmt
            .query_map(params, Self::parse_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// Resolve a zero-row terminal update into the right error.
    fn transition_error(&self, id: &SessionId) -> Error {
        match self.get(id) {
            Ok(Some(session)) => Error::InvalidState(format!(
                "session {id} is already {}",
                session.status.as_str()
            )),
            Ok(None) => Error::NotFound(format!("session {id}")),
            Err(error) => error,
        }
    }

    fn require(&self, id: &SessionId) -> Result<SyncSession> {
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("session {id}")))
    }
}

fn conversion_error(
    idx: usize,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error))
}

impl SessionRepository for SqliteSessionRepository<'_> {
    fn insert(&self, session: &SyncSession) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_sessions
                (id, user_id, device_id, kind, status, started_at, completed_at,
                 items_synced, conflicts, errors, metadata, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                session.id.as_str(),
                session.user_id,
                session.device_id,
                session.kind.as_str(),
                session.status.as_str(),
                session.started_at.timestamp_millis(),
                session.completed_at.map(|at| at.timestamp_millis()),
                session.items_synced,
                session.conflicts,
                session.errors,
                serde_json::to_string(&session.metadata)?,
                session.error_message
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &SessionId) -> Result<Option<SyncSession>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_sessions WHERE id = ?1");
        let session = self
            .conn
            .query_row(&sql, params![id.as_str()], Self::parse_session)
            .optional()?;
        Ok(session)
    }

    fn complete(
        &self,
        id: &SessionId,
        summary: &SessionSummary,
        completed_at: i64,
    ) -> Result<SyncSession> {
        let current = self.require(id)?;
        let mut metadata = match current.metadata {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        metadata.extend(summary.metadata.clone());

        let rows = self.conn.execute(
            "UPDATE sync_sessions
             SET status = 'completed', completed_at = ?1, items_synced = ?2,
                 conflicts = ?3, errors = ?4, metadata = ?5
             WHERE id = ?6 AND status = 'started'",
            params![
                completed_at,
                summary.items_synced,
                summary.conflicts,
                summary.errors,
                serde_json::to_string(&metadata)?,
                id.as_str()
            ],
        )?;
        if rows == 0 {
            return Err(self.transition_error(id));
        }
        self.require(id)
    }

    fn fail(&self, id: &SessionId, message: &str, completed_at: i64) -> Result<SyncSession> {
        let rows = self.conn.execute(
            "UPDATE sync_sessions
             SET status = 'failed', completed_at = ?1, error_message = ?2
             WHERE id = ?3 AND status = 'started'",
            params![completed_at, message, id.as_str()],
        )?;
        if rows == 0 {
            return Err(self.transition_error(id));
        }
        self.require(id)
    }

    fn any_started(&self, user_id: &str) -> Result<bool> {
        let started: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sync_sessions WHERE user_id = ?1 AND status = ?2)",
            params![user_id, SessionStatus::Started.as_str()],
            |row| row.get(0),
        )?;
        Ok(started)
    }

    fn last_completed(
        &self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<Option<SyncSession>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM sync_sessions
             WHERE user_id = ?1 AND status = 'completed' AND (?2 IS NULL OR device_id = ?2)
             ORDER BY completed_at DESC, id DESC
             LIMIT 1"
        );
        let session = self
            .conn
            .query_row(&sql, params![user_id, device_id], Self::parse_session)
            .optional()?;
        Ok(session)
    }

    fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<SyncSession>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM sync_sessions
             WHERE user_id = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2"
        );
        self.query_sessions(&sql, params![user_id, limit as i64])
    }

    fn fail_all_started(&self, message: &str, completed_at: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE sync_sessions
             SET status = 'failed', completed_at = ?1, error_message = ?2
             WHERE status = 'started'",
            params![completed_at, message],
        )?;
        Ok(rows)
    }

    fn delete_all(&self, user_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM sync_sessions WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(rows)
    }

    fn upsert_checkpoint(
        &self,
        user_id: &str,
        device_id: &str,
        last_sync_at: i64,
        session_id: &SessionId,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_checkpoints (user_id, device_id, last_sync_at, session_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, device_id) DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                session_id = excluded.session_id",
            params![user_id, device_id, last_sync_at, session_id.as_str()],
        )?;
        Ok(())
    }

    fn checkpoint(&self, user_id: &str, device_id: &str) -> Result<Option<SyncCheckpoint>> {
        let checkpoint = self
            .conn
            .query_row(
                "SELECT device_id, last_sync_at, session_id FROM sync_checkpoints
                 WHERE user_id = ?1 AND device_id = ?2",
                params![user_id, device_id],
                |row| {
                    let session_id: String = row.get(2)?;
                    Ok(SyncCheckpoint {
                        device_id: row.get(0)?,
                        last_sync_at: millis_to_datetime(row.get(1)?),
                        session_id: session_id
                            .parse()
                            .map_err(|error| conversion_error(2, error))?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn delete_checkpoints(&self, user_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM sync_checkpoints WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(rows)
    }
}
