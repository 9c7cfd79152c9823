//! Full-sync planner
//!
//! Computes what a device must pull to catch up: changed rows per entity kind
//! since its checkpoint, plus tombstones for rows deleted since then.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Months, NaiveDate, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::db::{LedgerRepository, SqliteLedgerRepository};
use crate::error::Result;
use crate::models::{DeletedEntity, EntityKind};

/// What a device asked to pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullSyncRequest {
    /// Checkpoint from the device's previous pull, if any
    pub last_sync: Option<DateTime<Utc>>,
    pub kinds: BTreeSet<EntityKind>,
    /// How far back a first pull reaches for transactions
    pub window_months: u32,
}

impl FullSyncRequest {
    /// Request every entity kind.
    pub fn all(last_sync: Option<DateTime<Utc>>, window_months: u32) -> Self {
        Self {
            last_sync,
            kinds: EntityKind::ALL.into_iter().collect(),
            window_months,
        }
    }
}

/// Rows and tombstones to hand back, plus the checkpoint the device stores next
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullSyncPlan {
    pub entities: BTreeMap<EntityKind, Vec<serde_json::Value>>,
    pub deleted: Vec<DeletedEntity>,
    pub checkpoint: DateTime<Utc>,
}

impl FullSyncPlan {
    /// Total number of rows and tombstones in the plan.
    pub fn item_count(&self) -> usize {
        self.entities.values().map(Vec::len).sum::<usize>() + self.deleted.len()
    }
}

/// Plans pulls against the ledger seen through `conn`
pub struct FullSyncPlanner<'a> {
    ledger: SqliteLedgerRepository<'a>,
}

impl<'a> FullSyncPlanner<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self {
            ledger: SqliteLedgerRepository::new(conn),
        }
    }

    /// Build the plan for `user_id` as of `started_at`.
    ///
    /// Any kind's query failure fails the whole plan.
    pub fn plan(
        &self,
        user_id: &str,
        request: &FullSyncRequest,
        started_at: DateTime<Utc>,
    ) -> Result<FullSyncPlan> {
        let since = request.last_sync.map(|at| at.timestamp_millis());
        let date_floor = transaction_window_floor(started_at, request.window_months);

        let mut entities = BTreeMap::new();
        let mut deleted = Vec::new();
        for &kind in &request.kinds {
            let rows = self
                .ledger
                .changed_rows(kind, user_id, since, Some(date_floor))?;
            entities.insert(kind, rows);

            if let Some(since) = since {
                deleted.extend(self.ledger.deleted_since(kind, user_id, since)?);
            }
        }

        Ok(FullSyncPlan {
            entities,
            deleted,
            checkpoint: started_at,
        })
    }
}

/// Earliest transaction date included in a first pull.
fn transaction_window_floor(now: DateTime<Utc>, months: u32) -> NaiveDate {
    now.date_naive()
        .checked_sub_months(Months::new(months))
        .unwrap_or(NaiveDate::MIN)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::TransactionType;
    use crate::sync::testing::{lunch, Fixture};
    use crate::util::millis_to_datetime;

    fn ids(plan: &FullSyncPlan, kind: EntityKind) -> Vec<i64> {
        plan.entities[&kind]
            .iter()
            .map(|row| row["id"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn window_floor_counts_back_calendar_months() {
        let now = "2024-05-31T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            transaction_window_floor(now, 3),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
    }

    #[test]
    fn first_pull_is_a_windowed_snapshot() {
        let fixture = Fixture::new();
        let ledger = SqliteLedgerRepository::new(fixture.conn());
        let today = Utc::now().date_naive();

        let mut recent = lunch("recent", fixture.account_id, fixture.category_id).data;
        recent.date = today;
        let mut old = recent.clone();
        old.date = today.checked_sub_months(Months::new(6)).unwrap();
        old.kind = TransactionType::Income;
        let recent_id = ledger.insert_transaction("alice", "recent", &recent).unwrap();
        ledger.insert_transaction("alice", "old", &old).unwrap();

        let planner = FullSyncPlanner::new(fixture.conn());
        let started_at = Utc::now();
        let plan = planner
            .plan("alice", &FullSyncRequest::all(None, 3), started_at)
            .unwrap();

        assert_eq!(plan.entities.len(), EntityKind::ALL.len());
        assert_eq!(ids(&plan, EntityKind::Accounts), vec![fixture.account_id]);
        assert_eq!(ids(&plan, EntityKind::Transactions), vec![recent_id]);
        assert!(plan.deleted.is_empty());
        assert_eq!(plan.checkpoint, started_at);
    }

    #[test]
    fn checkpointed_pulls_do_not_repeat_unchanged_rows() {
        let fixture = Fixture::new();
        let ledger = SqliteLedgerRepository::new(fixture.conn());
        let planner = FullSyncPlanner::new(fixture.conn());
        let kinds: BTreeSet<_> = [EntityKind::Accounts, EntityKind::Categories].into();

        let first = planner
            .plan(
                "alice",
                &FullSyncRequest {
                    last_sync: None,
                    kinds: kinds.clone(),
                    window_months: 3,
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(first.item_count(), 2);

        std::thread::sleep(std::time::Duration::from_millis(5));
        ledger
            .rename(EntityKind::Categories, "alice", fixture.category_id, "Dining")
            .unwrap();

        let second = planner
            .plan(
                "alice",
                &FullSyncRequest {
                    last_sync: Some(first.checkpoint),
                    kinds,
                    window_months: 3,
                },
                Utc::now(),
            )
            .unwrap();

        assert!(ids(&second, EntityKind::Accounts).is_empty());
        assert_eq!(ids(&second, EntityKind::Categories), vec![fixture.category_id]);
        assert_eq!(second.entities[&EntityKind::Categories][0]["name"], "Dining");
        assert!(second.checkpoint >= first.checkpoint);
    }

    #[test]
    fn deletions_since_checkpoint_become_tombstones() {
        let fixture = Fixture::new();
        let ledger = SqliteLedgerRepository::new(fixture.conn());
        let checkpoint = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        ledger
            .soft_delete(EntityKind::Accounts, "alice", fixture.account_id)
            .unwrap();

        let planner = FullSyncPlanner::new(fixture.conn());
        let plan = planner
            .plan(
                "alice",
                &FullSyncRequest::all(Some(checkpoint), 3),
                Utc::now(),
            )
            .unwrap();

        assert!(ids(&plan, EntityKind::Accounts).is_empty());
        assert_eq!(plan.deleted.len(), 1);
        assert_eq!(plan.deleted[0].kind, EntityKind::Accounts);
        assert_eq!(plan.deleted[0].id, fixture.account_id);

        // A checkpoint older than the row itself never produces a tombstone.
        let before_creation = millis_to_datetime(0);
        let replay = planner
            .plan(
                "alice",
                &FullSyncRequest::all(Some(before_creation), 3),
                Utc::now(),
            )
            .unwrap();
        assert!(replay.deleted.is_empty());
    }
}
