//! Ledger repository: the narrow interface the sync core has onto domain tables
//!
//! Account, category, budget, goal and bill CRUD lives elsewhere in the
//! product. Sync only needs to resolve foreign keys, create transactions,
//! and read rows changed or soft-deleted since a checkpoint, so that is all
//! this trait exposes (plus the creation helpers fixtures and seeding use).

use chrono::NaiveDate;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::{
    DeletedEntity, EntityKind, ReferenceState, ReferenceStatus, TransactionPayload, TransactionType,
};
use crate::util::{millis_to_datetime, now_millis};

/// Trait for the domain storage operations sync depends on
pub trait LedgerRepository {
    /// Create an account and return its id
    fn create_account(&self, user_id: &str, name: &str, opening_balance: f64) -> Result<i64>;

    /// Create a category (`income` or `expense`) and return its id
    fn create_category(&self, user_id: &str, name: &str, kind: &str) -> Result<i64>;

    /// Create a savings goal and return its id
    fn create_goal(&self, user_id: &str, name: &str, target_amount: f64) -> Result<i64>;

    /// Create a bill and return its id
    fn create_bill(&self, user_id: &str, name: &str, amount: f64, due_date: NaiveDate)
        -> Result<i64>;

    /// Rename a named entity, bumping `updated_at`
    fn rename(&self, kind: EntityKind, user_id: &str, id: i64, name: &str) -> Result<()>;

    /// Soft delete a row, leaving a tombstone for full sync
    fn soft_delete(&self, kind: EntityKind, user_id: &str, id: i64) -> Result<()>;

    /// Describe a referenced row from `user_id`'s point of view
    fn reference_state(&self, kind: EntityKind, user_id: &str, id: i64) -> Result<ReferenceState>;

    /// Current balance of an account, if it exists
    fn account_balance(&self, account_id: i64) -> Result<Option<f64>>;

    /// Server id of the transaction created for `(user_id, client_id)`, if any
    fn find_transaction_by_client_id(&self, user_id: &str, client_id: &str)
        -> Result<Option<i64>>;

    /// Insert a transaction keyed by its client id and adjust the account balance
    fn insert_transaction(
        &self,
        user_id: &str,
        client_id: &str,
        payload: &TransactionPayload,
    ) -> Result<i64>;

    /// Number of live transactions for a user
    fn count_transactions(&self, user_id: &str) -> Result<u64>;

    /// Live rows of `kind` changed after `since`; without `since`, all live rows
    /// (transactions dated on or after `date_floor` when given)
    fn changed_rows(
        &self,
        kind: EntityKind,
        user_id: &str,
        since: Option<i64>,
        date_floor: Option<NaiveDate>,
    ) -> Result<Vec<Value>>;

    /// Rows that existed at `since` and were soft-deleted after it
    fn deleted_since(&self, kind: EntityKind, user_id: &str, since: i64)
        -> Result<Vec<DeletedEntity>>;
}

/// `SQLite` implementation of `LedgerRepository`
pub struct SqliteLedgerRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteLedgerRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Columns each kind exposes to devices. `user_id` and `deleted_at` stay server-side.
    const fn columns(kind: EntityKind) -> &'static str {
        match kind {
            EntityKind::Accounts => "id, name, currency, balance, created_at, updated_at",
            EntityKind::Categories => "id, name, kind, created_at, updated_at",
            EntityKind::Budgets => "id, category_id, name, amount, period, created_at, updated_at",
            EntityKind::Goals => {
                "id, name, target_amount, current_amount, target_date, created_at, updated_at"
            }
            EntityKind::Bills => "id, name, amount, due_date, created_at, updated_at",
            EntityKind::Transactions => {
                "id, account_id, category_id, amount, type, date, description, client_id, created_at, updated_at"
            }
        }
    }

    fn row_to_json(row: &Row<'_>, columns: &[String]) -> rusqlite::Result<Value> {
        let mut object = Map::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            let value = match row.get_ref(idx)? {
                ValueRef::Null | ValueRef::Blob(_) => Value::Null,
                ValueRef::Integer(value) => Value::from(value),
                ValueRef::Real(value) => Value::from(value),
                ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            };
            object.insert(name.clone(), value);
        }
        Ok(Value::Object(object))
    }
}

impl LedgerRepository for SqliteLedgerRepository<'_> {
    fn create_account(&self, user_id: &str, name: &str, opening_balance: f64) -> Result<i64> {
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO accounts (user_id, name, balance, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![user_id, name, opening_balance, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn create_category(&self, user_id: &str, name: &str, kind: &str) -> Result<i64> {
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO categories (user_id, name, kind, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![user_id, name, kind, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn create_goal(&self, user_id: &str, name: &str, target_amount: f64) -> Result<i64> {
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO goals (user_id, name, target_amount, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![user_id, name, target_amount, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn create_bill(
        &self,
        user_id: &str,
        name: &str,
        amount: f64,
        due_date: NaiveDate,
    ) -> Result<i64> {
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO bills (user_id, name, amount, due_date, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![user_id, name, amount, due_date.to_string(), now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn rename(&self, kind: EntityKind, user_id: &str, id: i64, name: &str) -> Result<()> {
        if kind == EntityKind::Transactions {
            return Err(Error::InvalidInput("transactions have no name".to_string()));
        }
        let sql = format!(
            "UPDATE {} SET name = ?1, updated_at = ?2 WHERE id = ?3 AND user_id = ?4 AND deleted_at IS NULL",
            kind.table()
        );
        let rows = self
            .conn
            .execute(&sql, params![name, now_millis(), id, user_id])?;
        if rows == 0 {
            return Err(Error::NotFound(format!("{kind} {id}")));
        }
        Ok(())
    }

    fn soft_delete(&self, kind: EntityKind, user_id: &str, id: i64) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND user_id = ?3 AND deleted_at IS NULL",
            kind.table()
        );
        let rows = self.conn.execute(&sql, params![now_millis(), id, user_id])?;
        if rows == 0 {
            return Err(Error::NotFound(format!("{kind} {id}")));
        }
        Ok(())
    }

    fn reference_state(&self, kind: EntityKind, user_id: &str, id: i64) -> Result<ReferenceState> {
        let sql = format!("SELECT user_id, deleted_at FROM {} WHERE id = ?1", kind.table());
        let row = self
            .conn
            .query_row(&sql, params![id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
            })
            .optional()?;

        let state = match row {
            None => ReferenceState {
                id,
                status: ReferenceStatus::Missing,
                deleted_at: None,
            },
            Some((_, Some(deleted_at))) => ReferenceState {
                id,
                status: ReferenceStatus::Deleted,
                deleted_at: Some(millis_to_datetime(deleted_at)),
            },
            Some((owner, None)) if owner != user_id => ReferenceState {
                id,
                status: ReferenceStatus::Foreign,
                deleted_at: None,
            },
            Some(_) => ReferenceState {
                id,
                status: ReferenceStatus::Live,
                deleted_at: None,
            },
        };
        Ok(state)
    }

    fn account_balance(&self, account_id: i64) -> Result<Option<f64>> {
        let balance = self
            .conn
            .query_row(
                "SELECT balance FROM accounts WHERE id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance)
    }

    fn find_transaction_by_client_id(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM transactions WHERE user_id = ?1 AND client_id = ?2",
                params![user_id, client_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn insert_transaction(
        &self,
        user_id: &str,
        client_id: &str,
        payload: &TransactionPayload,
    ) -> Result<i64> {
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO transactions
                (user_id, account_id, category_id, amount, type, date, description, client_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                user_id,
                payload.account_id,
                payload.category_id,
                payload.amount,
                payload.kind.as_str(),
                payload.date.to_string(),
                payload.description,
                client_id,
                now
            ],
        )?;
        let transaction_id = self.conn.last_insert_rowid();

        if payload.kind != TransactionType::Transfer {
            let delta = payload.kind.balance_delta(payload.amount);
            // Forced records may point at another user's account; only the owner's balance moves.
            self.conn.execute(
                "UPDATE accounts SET balance = balance + ?1, updated_at = ?2
                 WHERE id = ?3 AND user_id = ?4 AND deleted_at IS NULL",
                params![delta, now, payload.account_id, user_id],
            )?;
        }

        Ok(transaction_id)
    }

    fn count_transactions(&self, user_id: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE user_id = ?1 AND deleted_at IS NULL",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn changed_rows(
        &self,
        kind: EntityKind,
        user_id: &str,
        since: Option<i64>,
        date_floor: Option<NaiveDate>,
    ) -> Result<Vec<Value>> {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE user_id = ?1 AND deleted_at IS NULL",
            Self::columns(kind),
            kind.table()
        );
        let mut values = vec![SqlValue::Text(user_id.to_string())];

        if let Some(since) = since {
            sql.push_str(" AND updated_at > ?2");
            values.push(SqlValue::Integer(since));
        } else if let (EntityKind::Transactions, Some(floor)) = (kind, date_floor) {
            sql.push_str(" AND date >= ?2");
            values.push(SqlValue::Text(floor.to_string()));
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let rows = stmt
            .query_map(params_from_iter(values), |row| Self::row_to_json(row, &columns))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn deleted_since(
        &self,
        kind: EntityKind,
        user_id: &str,
        since: i64,
    ) -> Result<Vec<DeletedEntity>> {
        let sql = format!(
            "SELECT id, deleted_at FROM {}
             WHERE user_id = ?1 AND deleted_at IS NOT NULL AND deleted_at > ?2 AND created_at <= ?2
             ORDER BY id",
            kind.table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let deleted = stmt
            .query_map(params![user_id, since], |row| {
                Ok(DeletedEntity {
                    kind,
                    id: row.get(0)?,
                    deleted_at: millis_to_datetime(row.get(1)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deleted)
    }
}
