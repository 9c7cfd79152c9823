//! Idempotency key store
//!
//! A client id is the idempotency key for one offline transaction. The key
//! lives on the `transactions` row itself, behind a partial `UNIQUE` index on
//! `(user_id, client_id)`, so the answer survives even when synced offline
//! records are not retained.

use rusqlite::Connection;

use crate::db::{LedgerRepository, SqliteLedgerRepository};
use crate::error::Result;

/// Whether a client id has already produced a server transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    AlreadyApplied { transaction_id: i64 },
    NotApplied,
}

impl IdempotencyOutcome {
    pub const fn transaction_id(self) -> Option<i64> {
        match self {
            Self::AlreadyApplied { transaction_id } => Some(transaction_id),
            Self::NotApplied => None,
        }
    }
}

/// Look up `(user_id, client_id)`. Read-only.
pub fn lookup(conn: &Connection, user_id: &str, client_id: &str) -> Result<IdempotencyOutcome> {
    let ledger = SqliteLedgerRepository::new(conn);
    Ok(ledger
        .find_transaction_by_client_id(user_id, client_id)?
        .map_or(IdempotencyOutcome::NotApplied, |transaction_id| {
            IdempotencyOutcome::AlreadyApplied { transaction_id }
        }))
}
