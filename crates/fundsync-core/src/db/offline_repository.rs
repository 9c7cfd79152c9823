//! Offline record repository implementation

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::models::{ConflictDetail, OfflineStatus, PendingOfflineRecord, TransactionPayload};
use crate::util::{millis_to_datetime, now_millis};

/// Fields written when a record is stored or re-stored
#[derive(Debug, Clone)]
pub struct OfflineEntry<'a> {
    pub user_id: &'a str,
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub payload: &'a TransactionPayload,
    pub client_created_at: i64,
    pub status: OfflineStatus,
    pub conflict: Option<&'a ConflictDetail>,
    pub last_error: Option<&'a str>,
    pub transaction_id: Option<i64>,
}

/// Per-status record counts for one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OfflineCounts {
    pub pending: u64,
    pub synced: u64,
    pub conflicts: u64,
}

/// Trait for offline record storage operations
pub trait OfflineRecordRepository {
    /// Insert or replace the record keyed by `(user_id, client_id)`, returning its id
    fn upsert(&self, entry: &OfflineEntry<'_>) -> Result<i64>;

    /// Get a record by server id, scoped to its owner
    fn get(&self, user_id: &str, id: i64) -> Result<Option<PendingOfflineRecord>>;

    /// Get a record by client id
    fn find_by_client_id(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<PendingOfflineRecord>>;

    /// List records in one status, oldest first
    fn list_by_status(
        &self,
        user_id: &str,
        status: OfflineStatus,
    ) -> Result<Vec<PendingOfflineRecord>>;

    /// Count records per status
    fn counts(&self, user_id: &str) -> Result<OfflineCounts>;

    /// Delete one record; returns whether a row was removed
    fn delete(&self, user_id: &str, id: i64) -> Result<bool>;

    /// Delete the record for a client id, if any
    fn delete_by_client_id(&self, user_id: &str, client_id: &str) -> Result<bool>;

    /// Delete every record for a user
    fn delete_all(&self, user_id: &str) -> Result<usize>;
}

/// `SQLite` implementation of `OfflineRecordRepository`
pub struct SqliteOfflineRecordRepository<'a> {
    conn: &'a Connection,
}

const SELECT_COLUMNS: &str = "id, user_id, device_id, client_id, payload, client_created_at, \
     sync_status, conflict, last_error, transaction_id, created_at, updated_at";

impl<'a> SqliteOfflineRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_record(row: &Row<'_>) -> rusqlite::Result<PendingOfflineRecord> {
        let status: String = row.get(6)?;
        let conflict: Option<String> = row.get(7)?;
        Ok(PendingOfflineRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            device_id: row.get(2)?,
            client_id: row.get(3)?,
            payload: json_column(row, 4)?,
            client_created_at: millis_to_datetime(row.get(5)?),
            sync_status: status.parse().map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(error))
            })?,
            conflict: conflict
                .map(|text| parse_json(7, &text))
                .transpose()?,
            last_error: row.get(8)?,
            transaction_id: row.get(9)?,
            created_at: millis_to_datetime(row.get(10)?),
            updated_at: millis_to_datetime(row.get(11)?),
        })
    }
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse_json(idx, &text)
}

fn parse_json<T: DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error)))
}

impl OfflineRecordRepository for SqliteOfflineRecordRepository<'_> {
    fn upsert(&self, entry: &OfflineEntry<'_>) -> Result<i64> {
        let now = now_millis();
        let payload = serde_json::to_string(entry.payload)?;
        let conflict = entry.conflict.map(serde_json::to_string).transpose()?;

        let id = self.conn.query_row(
            "INSERT INTO offline_records
                (user_id, device_id, client_id, payload, client_created_at, sync_status,
                 conflict, last_error, transaction_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(user_id, client_id) DO UPDATE SET
                device_id = excluded.device_id,
                payload = excluded.payload,
                client_created_at = excluded.client_created_at,
                sync_status = excluded.sync_status,
                conflict = excluded.conflict,
                last_error = excluded.last_error,
                transaction_id = excluded.transaction_id,
                updated_at = excluded.updated_at
             RETURNING id",
            params![
                entry.user_id,
                entry.device_id,
                entry.client_id,
                payload,
                entry.client_created_at,
                entry.status.as_str(),
                conflict,
                entry.last_error,
                entry.transaction_id,
                now
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn get(&self, user_id: &str, id: i64) -> Result<Option<PendingOfflineRecord>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM offline_records WHERE id = ?1 AND user_id = ?2");
        let record = self
            .conn
            .query_row(&sql, params![id, user_id], Self::parse_record)
            .optional()?;
        Ok(record)
    }

    fn find_by_client_id(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<PendingOfflineRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM offline_records WHERE user_id = ?1 AND client_id = ?2"
        );
        let record = self
            .conn
            .query_row(&sql, params![user_id, client_id], Self::parse_record)
            .optional()?;
        Ok(record)
    }

    fn list_by_status(
        &self,
        user_id: &str,
        status: OfflineStatus,
    ) -> Result<Vec<PendingOfflineRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM offline_records
             WHERE user_id = ?1 AND sync_status = ?2
             ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![user_id, status.as_str()], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn counts(&self, user_id: &str) -> Result<OfflineCounts> {
        let mut stmt = self.conn.prepare(
            "SELECT sync_status, COUNT(*) FROM offline_records WHERE user_id = ?1 GROUP BY sync_status",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = OfflineCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match status.parse::<OfflineStatus>()? {
                OfflineStatus::Pending => counts.pending = count,
                OfflineStatus::Synced => counts.synced = count,
                OfflineStatus::Conflict => counts.conflicts = count,
            }
        }
        Ok(counts)
    }

    fn delete(&self, user_id: &str, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM offline_records WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(rows > 0)
    }

    fn delete_by_client_id(&self, user_id: &str, client_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM offline_records WHERE user_id = ?1 AND client_id = ?2",
            params![user_id, client_id],
        )?;
        Ok(rows > 0)
    }

    fn delete_all(&self, user_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM offline_records WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::Database;
    use crate::models::{ConflictReason, ReferenceState, ReferenceStatus, ServerState, TransactionType};

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn payload() -> TransactionPayload {
        TransactionPayload {
            account_id: 5,
            category_id: 2,
            amount: 100.0,
            kind: TransactionType::Expense,
            date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            description: "Lunch".to_string(),
        }
    }

    fn detail() -> ConflictDetail {
        ConflictDetail::new(
            vec![ConflictReason::AccountMissing],
            ServerState {
                account: ReferenceState {
                    id: 5,
                    status: ReferenceStatus::Missing,
                    deleted_at: None,
                },
                category: ReferenceState {
                    id: 2,
                    status: ReferenceStatus::Live,
                    deleted_at: None,
                },
            },
        )
    }

    fn entry<'a>(
        client_id: &'a str,
        payload: &'a TransactionPayload,
        status: OfflineStatus,
        conflict: Option<&'a ConflictDetail>,
    ) -> OfflineEntry<'a> {
        OfflineEntry {
            user_id: "alice",
            device_id: "dev1",
            client_id,
            payload,
            client_created_at: 1_705_320_000_000,
            status,
            conflict,
            last_error: None,
            transaction_id: None,
        }
    }

    #[test]
    fn test_upsert_keeps_one_row_per_client_id() {
        let db = setup();
        let repo = SqliteOfflineRecordRepository::new(db.connection());
        let payload = payload();
        let detail = detail();

        let first = repo
            .upsert(&entry("abc", &payload, OfflineStatus::Conflict, Some(&detail)))
            .unwrap();
        let second = repo
            .upsert(&entry("abc", &payload, OfflineStatus::Pending, None))
            .unwrap();
        assert_eq!(first, second);

        let record = repo.get("alice", first).unwrap().unwrap();
        assert_eq!(record.sync_status, OfflineStatus::Pending);
        assert_eq!(record.conflict, None);
        assert_eq!(record.payload, payload);
    }

    #[test]
    fn test_conflict_detail_round_trips() {
        let db = setup();
        let repo = SqliteOfflineRecordRepository::new(db.connection());
        let payload = payload();
        let detail = detail();

        repo.upsert(&entry("abc", &payload, OfflineStatus::Conflict, Some(&detail)))
            .unwrap();

        let conflicts = repo
            .list_by_status("alice", OfflineStatus::Conflict)
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict.as_ref(), Some(&detail));
        assert_eq!(conflicts[0].client_created_at.timestamp_millis(), 1_705_320_000_000);
    }

    #[test]
    fn test_get_is_scoped_to_owner() {
        let db = setup();
        let repo = SqliteOfflineRecordRepository::new(db.connection());
        let payload = payload();

        let id = repo
            .upsert(&entry("abc", &payload, OfflineStatus::Pending, None))
            .unwrap();
        assert!(repo.get("mallory", id).unwrap().is_none());
        assert!(!repo.delete("mallory", id).unwrap());
        assert!(repo.delete("alice", id).unwrap());
    }

    #[test]
    fn test_counts_by_status() {
        let db = setup();
        let repo = SqliteOfflineRecordRepository::new(db.connection());
        let payload = payload();
        let detail = detail();

        repo.upsert(&entry("a", &payload, OfflineStatus::Pending, None))
            .unwrap();
        repo.upsert(&entry("b", &payload, OfflineStatus::Conflict, Some(&detail)))
            .unwrap();
        repo.upsert(&entry("c", &payload, OfflineStatus::Conflict, Some(&detail)))
            .unwrap();

        let counts = repo.counts("alice").unwrap();
        assert_eq!(
            counts,
            OfflineCounts {
                pending: 1,
                synced: 0,
                conflicts: 2
            }
        );
        assert_eq!(repo.delete_all("alice").unwrap(), 3);
        assert_eq!(repo.counts("alice").unwrap(), OfflineCounts::default());
    }
}
