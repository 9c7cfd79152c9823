//! Transaction reconciler
//!
//! Applies client-submitted offline transactions one at a time, in submission
//! order, on a single connection so later records observe earlier writes.

use rusqlite::{Connection, Transaction};
use serde::Serialize;

use super::conflict::{ConflictDetector, Verdict};
use super::idempotency::{self, IdempotencyOutcome};
use crate::db::{
    LedgerRepository, OfflineEntry, OfflineRecordRepository, SqliteLedgerRepository,
    SqliteOfflineRecordRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    BatchMode, ConflictDetail, OfflineStatus, OfflineTransaction, SessionSummary,
};
use crate::util::compact_text;

/// Result of reconciling one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordResult {
    Synced {
        server_id: i64,
    },
    Conflict {
        conflict_id: i64,
        detail: ConflictDetail,
    },
    Error {
        message: String,
    },
}

/// Per-record entry of a batch response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    pub client_id: String,
    #[serde(flatten)]
    pub result: RecordResult,
}

/// Who a batch is applied for
#[derive(Debug, Clone, Copy)]
pub struct ReconcileScope<'a> {
    pub user_id: &'a str,
    pub device_id: &'a str,
    /// Keep a `synced` offline row per applied record
    pub retain_synced: bool,
}

/// Reconciles records against the ledger seen through `conn`
pub struct Reconciler<'a> {
    conn: &'a Connection,
    scope: ReconcileScope<'a>,
}

impl<'a> Reconciler<'a> {
    pub const fn new(conn: &'a Connection, scope: ReconcileScope<'a>) -> Self {
        Self { conn, scope }
    }

    /// Apply one record.
    ///
    /// Conflicts are returned as data. `Err` means the record could not be
    /// processed at all; the caller decides how much work to roll back.
    pub fn apply(&self, record: &OfflineTransaction, force: bool) -> Result<RecordResult> {
        record.validate()?;
        let user_id = self.scope.user_id;

        if let IdempotencyOutcome::AlreadyApplied { transaction_id } =
            idempotency::lookup(self.conn, user_id, &record.client_id)?
        {
            tracing::debug!(client_id = %record.client_id, transaction_id, "Record already applied");
            return Ok(RecordResult::Synced {
                server_id: transaction_id,
            });
        }

        let offline = SqliteOfflineRecordRepository::new(self.conn);
        if let Verdict::Conflict(detail) =
            ConflictDetector::new(self.conn).evaluate(user_id, record, force)?
        {
            let conflict_id = offline.upsert(&self.entry(
                record,
                OfflineStatus::Conflict,
                Some(&detail),
                None,
            ))?;
            return Ok(RecordResult::Conflict {
                conflict_id,
                detail,
            });
        }

        let ledger = SqliteLedgerRepository::new(self.conn);
        let server_id = match ledger.insert_transaction(user_id, &record.client_id, &record.data) {
            Ok(id) => id,
            Err(error) if error.is_unique_violation() => {
                // Another writer applied the same client id first; report its row.
                let existing = idempotency::lookup(self.conn, user_id, &record.client_id)?;
                return existing
                    .transaction_id()
                    .map(|server_id| RecordResult::Synced { server_id })
                    .ok_or(error);
            }
            Err(error) => return Err(error),
        };

        if self.scope.retain_synced {
            offline.upsert(&self.entry(record, OfflineStatus::Synced, None, Some(server_id)))?;
        } else {
            offline.delete_by_client_id(user_id, &record.client_id)?;
        }

        Ok(RecordResult::Synced { server_id })
    }

    /// Remember a record whose processing failed so the device can retry it.
    fn record_failure(&self, record: &OfflineTransaction, message: &str) {
        let offline = SqliteOfflineRecordRepository::new(self.conn);
        let mut entry = self.entry(record, OfflineStatus::Pending, None, None);
        entry.last_error = Some(message);
        if let Err(error) = offline.upsert(&entry) {
            tracing::warn!(client_id = %record.client_id, %error, "Could not store pending record");
        }
    }

    fn entry<'r>(
        &'r self,
        record: &'r OfflineTransaction,
        status: OfflineStatus,
        conflict: Option<&'r ConflictDetail>,
        transaction_id: Option<i64>,
    ) -> OfflineEntry<'r> {
        OfflineEntry {
            user_id: self.scope.user_id,
            device_id: self.scope.device_id,
            client_id: &record.client_id,
            payload: &record.data,
            client_created_at: record.created_at.timestamp_millis(),
            status,
            conflict,
            last_error: None,
            transaction_id,
        }
    }
}

/// Outcome of a whole batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub results: Vec<RecordOutcome>,
    pub synced: u32,
    pub conflicts: u32,
    pub errors: u32,
}

impl BatchOutcome {
    fn push(&mut self, client_id: &str, result: RecordResult) {
        match result {
            RecordResult::Synced { .. } => self.synced += 1,
            RecordResult::Conflict { .. } => self.conflicts += 1,
            RecordResult::Error { .. } => self.errors += 1,
        }
        self.results.push(RecordOutcome {
            client_id: client_id.to_string(),
            result,
        });
    }

    /// Counters to close the batch's session with.
    pub fn summary(&self, mode: BatchMode, requested: usize) -> SessionSummary {
        let mut summary = SessionSummary {
            items_synced: self.synced,
            conflicts: self.conflicts,
            errors: self.errors,
            ..SessionSummary::default()
        };
        summary
            .metadata
            .insert("batch_mode".to_string(), mode.as_str().into());
        summary
            .metadata
            .insert("requested".to_string(), requested.into());
        summary
    }
}

/// Reconcile `records` in order inside `tx`.
///
/// In [`BatchMode::Isolated`] each record runs under its own savepoint; a
/// failing record is rolled back alone and reported as an error result. In
/// [`BatchMode::Atomic`] the first failure is returned and the caller rolls
/// back everything.
pub fn run_batch(
    tx: &mut Transaction<'_>,
    scope: ReconcileScope<'_>,
    records: &[OfflineTransaction],
    force: bool,
    mode: BatchMode,
) -> Result<BatchOutcome> {
    let mut outcome = BatchOutcome::default();
    for record in records {
        let result = match mode {
            BatchMode::Atomic => Reconciler::new(tx, scope).apply(record, force)?,
            BatchMode::Isolated => apply_isolated(tx, scope, record, force)?,
        };
        outcome.push(&record.client_id, result);
    }
    Ok(outcome)
}

fn apply_isolated(
    tx: &mut Transaction<'_>,
    scope: ReconcileScope<'_>,
    record: &OfflineTransaction,
    force: bool,
) -> Result<RecordResult> {
    let savepoint = tx.savepoint()?;
    let applied = Reconciler::new(&savepoint, scope).apply(record, force);
    match applied {
        Ok(result) => {
            savepoint.commit()?;
            Ok(result)
        }
        Err(error) => {
            // Dropping the savepoint rolls back this record's writes.
            drop(savepoint);
            let message = compact_text(&error.to_string());
            tracing::warn!(client_id = %record.client_id, error = %message, "Record failed");
            if !matches!(error, Error::InvalidInput(_)) {
                Reconciler::new(tx, scope).record_failure(record, &message);
            }
            Ok(RecordResult::Error { message })
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::{Database, OfflineRecordRepository};
    use crate::models::ConflictReason;
    use crate::sync::testing::{install_failure_trigger, lunch, Fixture};

    fn scope(retain_synced: bool) -> ReconcileScope<'static> {
        ReconcileScope {
            user_id: "alice",
            device_id: "dev1",
            retain_synced,
        }
    }

    fn run(
        db: &mut Database,
        records: &[OfflineTransaction],
        force: bool,
        mode: BatchMode,
    ) -> Result<BatchOutcome> {
        let mut tx = db.connection_mut().transaction()?;
        let outcome = run_batch(&mut tx, scope(true), records, force, mode)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn server_id(outcome: &BatchOutcome, index: usize) -> i64 {
        match outcome.results[index].result {
            RecordResult::Synced { server_id } => server_id,
            ref other => panic!("expected synced, got {other:?}"),
        }
    }

    #[test]
    fn resubmission_returns_the_same_server_id() {
        let mut fixture = Fixture::new();
        let record = lunch("abc", fixture.account_id, fixture.category_id);

        let first = run(&mut fixture.db, &[record.clone()], false, BatchMode::Isolated).unwrap();
        let second = run(&mut fixture.db, &[record], false, BatchMode::Isolated).unwrap();

        assert_eq!(server_id(&first, 0), server_id(&second, 0));
        let ledger = SqliteLedgerRepository::new(fixture.conn());
        assert_eq!(ledger.count_transactions("alice").unwrap(), 1);
        assert_eq!(
            ledger.account_balance(fixture.account_id).unwrap(),
            Some(900.0)
        );
    }

    #[test]
    fn duplicate_within_one_batch_applies_once() {
        let mut fixture = Fixture::new();
        let record = lunch("abc", fixture.account_id, fixture.category_id);

        let outcome = run(
            &mut fixture.db,
            &[record.clone(), record],
            false,
            BatchMode::Atomic,
        )
        .unwrap();

        assert_eq!(outcome.synced, 2);
        assert_eq!(server_id(&outcome, 0), server_id(&outcome, 1));
        let ledger = SqliteLedgerRepository::new(fixture.conn());
        assert_eq!(ledger.count_transactions("alice").unwrap(), 1);
    }

    #[test]
    fn conflict_does_not_touch_the_ledger() {
        let mut fixture = Fixture::new();
        let record = lunch("abc", fixture.foreign_account_id, fixture.category_id);

        let outcome = run(&mut fixture.db, &[record], false, BatchMode::Isolated).unwrap();

        let RecordResult::Conflict { conflict_id, detail } = &outcome.results[0].result else {
            panic!("expected a conflict");
        };
        assert_eq!(detail.reasons, vec![ConflictReason::AccountNotOwned]);
        assert_eq!(outcome.conflicts, 1);

        let ledger = SqliteLedgerRepository::new(fixture.conn());
        assert_eq!(ledger.count_transactions("alice").unwrap(), 0);
        assert_eq!(ledger.count_transactions("bob").unwrap(), 0);
        assert_eq!(
            ledger.account_balance(fixture.foreign_account_id).unwrap(),
            Some(500.0)
        );

        let stored = SqliteOfflineRecordRepository::new(fixture.conn())
            .get("alice", *conflict_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.sync_status, OfflineStatus::Conflict);
        assert_eq!(stored.conflict.as_ref(), Some(detail));
    }

    #[test]
    fn force_applies_a_foreign_reference() {
        let mut fixture = Fixture::new();
        let record = lunch("abc", fixture.foreign_account_id, fixture.category_id);

        let conflicted = run(&mut fixture.db, &[record.clone()], false, BatchMode::Isolated).unwrap();
        assert_eq!(conflicted.conflicts, 1);

        let forced = run(&mut fixture.db, &[record], true, BatchMode::Isolated).unwrap();
        let transaction_id = server_id(&forced, 0);

        let ledger = SqliteLedgerRepository::new(fixture.conn());
        assert_eq!(ledger.count_transactions("alice").unwrap(), 1);
        // Only an account the user owns has its balance moved.
        assert_eq!(
            ledger.account_balance(fixture.foreign_account_id).unwrap(),
            Some(500.0)
        );

        let stored = SqliteOfflineRecordRepository::new(fixture.conn())
            .find_by_client_id("alice", "abc")
            .unwrap()
            .unwrap();
        assert_eq!(stored.sync_status, OfflineStatus::Synced);
        assert_eq!(stored.transaction_id, Some(transaction_id));
        assert_eq!(stored.conflict, None);
    }

    #[test]
    fn atomic_batch_rolls_back_every_record() {
        let mut fixture = Fixture::new();
        install_failure_trigger(fixture.conn());
        let mut boom = lunch("two", fixture.account_id, fixture.category_id);
        boom.data.description = "boom".to_string();
        let records = [
            lunch("one", fixture.account_id, fixture.category_id),
            boom,
            lunch("three", fixture.account_id, fixture.category_id),
        ];

        let err = run(&mut fixture.db, &records, false, BatchMode::Atomic).unwrap_err();
        assert!(matches!(err, Error::Database(_)));

        let ledger = SqliteLedgerRepository::new(fixture.conn());
        assert_eq!(ledger.count_transactions("alice").unwrap(), 0);
        assert_eq!(
            ledger.account_balance(fixture.account_id).unwrap(),
            Some(1_000.0)
        );
        let counts = SqliteOfflineRecordRepository::new(fixture.conn())
            .counts("alice")
            .unwrap();
        assert_eq!(counts.synced, 0);
    }

    #[test]
    fn isolated_batch_keeps_the_good_records() {
        let mut fixture = Fixture::new();
        install_failure_trigger(fixture.conn());
        let mut boom = lunch("two", fixture.account_id, fixture.category_id);
        boom.data.description = "boom".to_string();
        let records = [
            lunch("one", fixture.account_id, fixture.category_id),
            boom,
            lunch("three", fixture.account_id, fixture.category_id),
        ];

        let outcome = run(&mut fixture.db, &records, false, BatchMode::Isolated).unwrap();
        assert_eq!((outcome.synced, outcome.conflicts, outcome.errors), (2, 0, 1));
        let RecordResult::Error { message } = &outcome.results[1].result else {
            panic!("expected an error result");
        };
        assert!(message.contains("injected failure"));

        let ledger = SqliteLedgerRepository::new(fixture.conn());
        assert_eq!(ledger.count_transactions("alice").unwrap(), 2);
        assert_eq!(
            ledger.account_balance(fixture.account_id).unwrap(),
            Some(800.0)
        );

        let pending = SqliteOfflineRecordRepository::new(fixture.conn())
            .find_by_client_id("alice", "two")
            .unwrap()
            .unwrap();
        assert_eq!(pending.sync_status, OfflineStatus::Pending);
        assert!(pending.last_error.is_some());
    }

    #[test]
    fn invalid_record_is_an_error_result_without_a_pending_row() {
        let mut fixture = Fixture::new();
        let mut record = lunch("neg", fixture.account_id, fixture.category_id);
        record.data.amount = -5.0;

        let outcome = run(&mut fixture.db, &[record], false, BatchMode::Isolated).unwrap();
        assert_eq!(outcome.errors, 1);
        assert!(SqliteOfflineRecordRepository::new(fixture.conn())
            .find_by_client_id("alice", "neg")
            .unwrap()
            .is_none());
    }

    #[test]
    fn successes_can_skip_the_offline_store() {
        let mut fixture = Fixture::new();
        let record = lunch("abc", fixture.account_id, fixture.category_id);

        let mut tx = fixture.db.connection_mut().transaction().unwrap();
        let first = run_batch(&mut tx, scope(false), &[record.clone()], false, BatchMode::Isolated)
            .unwrap();
        let again = run_batch(&mut tx, scope(false), &[record], false, BatchMode::Isolated)
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(server_id(&first, 0), server_id(&again, 0));
        let counts = SqliteOfflineRecordRepository::new(fixture.conn())
            .counts("alice")
            .unwrap();
        assert_eq!(counts.synced, 0);
    }

    #[test]
    fn summary_carries_counts_and_mode() {
        let mut outcome = BatchOutcome::default();
        outcome.push("a", RecordResult::Synced { server_id: 1 });
        outcome.push(
            "b",
            RecordResult::Error {
                message: "bad".to_string(),
            },
        );

        let summary = outcome.summary(BatchMode::Isolated, 2);
        assert_eq!(summary.items_synced, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.metadata["batch_mode"], "isolated");
        assert_eq!(summary.metadata["requested"], 2);

        let json = serde_json::to_value(&outcome.results[0]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "client_id": "a", "status": "synced", "server_id": 1 })
        );
    }
}
