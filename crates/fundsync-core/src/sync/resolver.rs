//! Conflict resolver
//!
//! Applies a client's chosen resolution to each stored conflict. Every
//! resolution runs under its own savepoint, so one failure never undoes the
//! others.

use rusqlite::{Connection, Transaction};
use serde::Serialize;

use super::reconciler::{ReconcileScope, Reconciler, RecordResult};
use crate::db::{OfflineEntry, OfflineRecordRepository, SqliteOfflineRecordRepository};
use crate::error::{Error, Result};
use crate::models::{
    ConflictDetail, ConflictResolution, OfflineStatus, OfflineTransaction, PendingOfflineRecord,
    TransactionPayload,
};
use crate::util::compact_text;

/// What happened to one conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved {
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction_id: Option<i64>,
    },
    StillConflicting {
        detail: ConflictDetail,
    },
    NotFound,
    Error {
        message: String,
    },
}

/// Per-item entry of a resolve response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionOutcome {
    pub conflict_id: i64,
    pub action: &'static str,
    #[serde(flatten)]
    pub status: ResolutionStatus,
}

impl ResolutionOutcome {
    pub const fn is_resolved(&self) -> bool {
        matches!(self.status, ResolutionStatus::Resolved { .. })
    }
}

/// Resolves one user's conflicts through `conn`
pub struct ConflictResolver<'a> {
    conn: &'a Connection,
    user_id: &'a str,
    retain_synced: bool,
}

impl<'a> ConflictResolver<'a> {
    pub const fn new(conn: &'a Connection, user_id: &'a str, retain_synced: bool) -> Self {
        Self {
            conn,
            user_id,
            retain_synced,
        }
    }

    /// Apply one resolution.
    ///
    /// Unknown ids, other users' records and records no longer in conflict
    /// all read as [`ResolutionStatus::NotFound`].
    pub fn resolve(&self, resolution: &ConflictResolution) -> Result<ResolutionStatus> {
        let offline = SqliteOfflineRecordRepository::new(self.conn);
        let Some(stored) = offline
            .get(self.user_id, resolution.conflict_id())?
            .filter(|record| record.sync_status == OfflineStatus::Conflict)
        else {
            return Ok(ResolutionStatus::NotFound);
        };

        match resolution {
            ConflictResolution::UseServer { .. } => {
                offline.delete(self.user_id, stored.id)?;
                Ok(ResolutionStatus::Resolved {
                    transaction_id: None,
                })
            }
            ConflictResolution::UseClient { .. } => {
                self.reapply(&stored, stored.payload.clone(), true)
            }
            ConflictResolution::Merge { data, .. } => {
                if data.is_empty() {
                    return Err(Error::InvalidInput(
                        "merge requires at least one field".to_string(),
                    ));
                }
                self.reapply(&stored, data.apply_to(&stored.payload), false)
            }
        }
    }

    fn reapply(
        &self,
        stored: &PendingOfflineRecord,
        payload: TransactionPayload,
        force: bool,
    ) -> Result<ResolutionStatus> {
        let record = OfflineTransaction {
            client_id: stored.client_id.clone(),
            data: payload,
            created_at: stored.client_created_at,
        };
        let scope = ReconcileScope {
            user_id: self.user_id,
            device_id: &stored.device_id,
            retain_synced: self.retain_synced,
        };

        match Reconciler::new(self.conn, scope).apply(&record, force)? {
            RecordResult::Synced { server_id } => {
                self.settle(&record, &stored.device_id, server_id)?;
                Ok(ResolutionStatus::Resolved {
                    transaction_id: Some(server_id),
                })
            }
            RecordResult::Conflict { detail, .. } => {
                Ok(ResolutionStatus::StillConflicting { detail })
            }
            RecordResult::Error { message } => Ok(ResolutionStatus::Error { message }),
        }
    }

    /// Make sure the stored record no longer reads as a conflict, even when
    /// the client id had already been applied by another device.
    fn settle(&self, record: &OfflineTransaction, device_id: &str, server_id: i64) -> Result<()> {
        let offline = SqliteOfflineRecordRepository::new(self.conn);
        if self.retain_synced {
            offline.upsert(&OfflineEntry {
                user_id: self.user_id,
                device_id,
                client_id: &record.client_id,
                payload: &record.data,
                client_created_at: record.created_at.timestamp_millis(),
                status: OfflineStatus::Synced,
                conflict: None,
                last_error: None,
                transaction_id: Some(server_id),
            })?;
        } else {
            offline.delete_by_client_id(self.user_id, &record.client_id)?;
        }
        Ok(())
    }
}

/// Apply `resolutions` in order inside `tx`, one savepoint each.
pub fn resolve_all(
    tx: &mut Transaction<'_>,
    user_id: &str,
    retain_synced: bool,
    resolutions: &[ConflictResolution],
) -> Result<Vec<ResolutionOutcome>> {
    let mut outcomes = Vec::with_capacity(resolutions.len());
    for resolution in resolutions {
        let savepoint = tx.savepoint()?;
        let resolved = ConflictResolver::new(&savepoint, user_id, retain_synced).resolve(resolution);
        let status = match resolved {
            Ok(status) => {
                savepoint.commit()?;
                status
            }
            Err(error) => {
                drop(savepoint);
                let message = compact_text(&error.to_string());
                tracing::warn!(
                    conflict_id = resolution.conflict_id(),
                    error = %message,
                    "Conflict resolution failed"
                );
                ResolutionStatus::Error { message }
            }
        };
        outcomes.push(ResolutionOutcome {
            conflict_id: resolution.conflict_id(),
            action: resolution.action(),
            status,
        });
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::{LedgerRepository, SqliteLedgerRepository};
    use crate::models::{ConflictReason, MergeFields};
    use crate::sync::testing::{lunch, Fixture};

    /// Submit a record expected to conflict and return its conflict id.
    fn conflict(fixture: &Fixture, client_id: &str, account_id: i64) -> i64 {
        let scope = ReconcileScope {
            user_id: "alice",
            device_id: "dev1",
            retain_synced: true,
        };
        let record = lunch(client_id, account_id, fixture.category_id);
        match Reconciler::new(fixture.conn(), scope).apply(&record, false).unwrap() {
            RecordResult::Conflict { conflict_id, .. } => conflict_id,
            other => panic!("expected a conflict, got {other:?}"),
        }
    }

    fn resolve(fixture: &mut Fixture, resolutions: &[ConflictResolution]) -> Vec<ResolutionOutcome> {
        let mut tx = fixture.db.connection_mut().transaction().unwrap();
        let outcomes = resolve_all(&mut tx, "alice", true, resolutions).unwrap();
        tx.commit().unwrap();
        outcomes
    }

    #[test]
    fn use_server_discards_the_client_record() {
        let mut fixture = Fixture::new();
        let conflict_id = conflict(&fixture, "abc", fixture.foreign_account_id);

        let outcomes = resolve(&mut fixture, &[ConflictResolution::UseServer { conflict_id }]);
        assert_eq!(
            outcomes[0].status,
            ResolutionStatus::Resolved {
                transaction_id: None
            }
        );
        let offline = SqliteOfflineRecordRepository::new(fixture.conn());
        assert!(offline.get("alice", conflict_id).unwrap().is_none());
        assert_eq!(
            SqliteLedgerRepository::new(fixture.conn())
                .count_transactions("alice")
                .unwrap(),
            0
        );
    }

    #[test]
    fn use_client_forces_an_ownership_conflict_through() {
        let mut fixture = Fixture::new();
        let conflict_id = conflict(&fixture, "abc", fixture.foreign_account_id);

        let outcomes = resolve(&mut fixture, &[ConflictResolution::UseClient { conflict_id }]);
        let ResolutionStatus::Resolved {
            transaction_id: Some(transaction_id),
        } = outcomes[0].status
        else {
            panic!("expected resolved, got {:?}", outcomes[0].status);
        };

        let stored = SqliteOfflineRecordRepository::new(fixture.conn())
            .get("alice", conflict_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.sync_status, OfflineStatus::Synced);
        assert_eq!(stored.transaction_id, Some(transaction_id));
    }

    #[test]
    fn use_client_cannot_resurrect_a_missing_account() {
        let mut fixture = Fixture::new();
        let conflict_id = conflict(&fixture, "abc", 9_999);

        let outcomes = resolve(&mut fixture, &[ConflictResolution::UseClient { conflict_id }]);
        let ResolutionStatus::StillConflicting { detail } = &outcomes[0].status else {
            panic!("expected still conflicting");
        };
        assert_eq!(detail.reasons, vec![ConflictReason::AccountMissing]);
        assert!(!outcomes[0].is_resolved());
    }

    #[test]
    fn merge_overlays_fields_and_applies() {
        let mut fixture = Fixture::new();
        let conflict_id = conflict(&fixture, "abc", 9_999);
        let merge = ConflictResolution::Merge {
            conflict_id,
            data: MergeFields {
                account_id: Some(fixture.account_id),
                amount: Some(42.5),
                ..MergeFields::default()
            },
        };

        let outcomes = resolve(&mut fixture, &[merge]);
        assert!(outcomes[0].is_resolved());

        let stored = SqliteOfflineRecordRepository::new(fixture.conn())
            .get("alice", conflict_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.payload.account_id, fixture.account_id);
        assert_eq!(stored.payload.description, "Lunch");
        assert_eq!(
            SqliteLedgerRepository::new(fixture.conn())
                .account_balance(fixture.account_id)
                .unwrap(),
            Some(957.5)
        );
    }

    #[test]
    fn bad_items_do_not_block_good_ones() {
        let mut fixture = Fixture::new();
        let first = conflict(&fixture, "one", fixture.foreign_account_id);
        let second = conflict(&fixture, "two", fixture.foreign_account_id);

        let outcomes = resolve(
            &mut fixture,
            &[
                ConflictResolution::Merge {
                    conflict_id: first,
                    data: MergeFields::default(),
                },
                ConflictResolution::UseServer {
                    conflict_id: 424_242,
                },
                ConflictResolution::UseServer {
                    conflict_id: second,
                },
            ],
        );

        assert!(matches!(outcomes[0].status, ResolutionStatus::Error { .. }));
        assert_eq!(outcomes[1].status, ResolutionStatus::NotFound);
        assert!(outcomes[2].is_resolved());
        assert_eq!(outcomes[2].action, "use_server");

        let counts = SqliteOfflineRecordRepository::new(fixture.conn())
            .counts("alice")
            .unwrap();
        assert_eq!(counts.conflicts, 1);
    }

    #[test]
    fn other_users_conflicts_are_not_found() {
        let mut fixture = Fixture::new();
        let conflict_id = conflict(&fixture, "abc", fixture.foreign_account_id);

        let mut tx = fixture.db.connection_mut().transaction().unwrap();
        let outcomes =
            resolve_all(&mut tx, "bob", true, &[ConflictResolution::UseServer { conflict_id }])
                .unwrap();
        tx.commit().unwrap();

        assert_eq!(outcomes[0].status, ResolutionStatus::NotFound);
    }
}
