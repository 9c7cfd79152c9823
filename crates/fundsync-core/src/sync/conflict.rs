//! Conflict detector
//!
//! Decides whether a submitted record can be applied against current server
//! state. The decision is binary; the detail explains which references
//! diverged. Nothing here writes.

use rusqlite::Connection;

use crate::db::{LedgerRepository, SqliteLedgerRepository};
use crate::error::Result;
use crate::models::{
    ConflictDetail, ConflictReason, EntityKind, OfflineTransaction, ServerState,
};

/// Outcome of evaluating one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clear,
    Conflict(ConflictDetail),
}

/// Evaluates records against the ledger seen through `conn`
pub struct ConflictDetector<'a> {
    ledger: SqliteLedgerRepository<'a>,
}

impl<'a> ConflictDetector<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self {
            ledger: SqliteLedgerRepository::new(conn),
        }
    }

    /// Check `record`'s account and category from `user_id`'s point of view.
    ///
    /// A missing or soft-deleted reference always conflicts. A reference owned
    /// by someone else conflicts unless `force` is set.
    pub fn evaluate(
        &self,
        user_id: &str,
        record: &OfflineTransaction,
        force: bool,
    ) -> Result<Verdict> {
        let payload = &record.data;
        let account = self
            .ledger
            .reference_state(EntityKind::Accounts, user_id, payload.account_id)?;
        let category = self
            .ledger
            .reference_state(EntityKind::Categories, user_id, payload.category_id)?;

        let reasons: Vec<ConflictReason> = [
            ConflictReason::for_account(&account),
            ConflictReason::for_category(&category),
        ]
        .into_iter()
        .flatten()
        .filter(|reason| !force || reason.survives_force())
        .collect();

        if reasons.is_empty() {
            return Ok(Verdict::Clear);
        }

        tracing::debug!(
            client_id = %record.client_id,
            reasons = reasons.len(),
            force,
            "Record conflicts with server state"
        );
        Ok(Verdict::Conflict(ConflictDetail::new(
            reasons,
            ServerState { account, category },
        )))
    }
}
