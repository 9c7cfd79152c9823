//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, V1_LEDGER)?;
    }
    if version < 2 {
        apply(conn, 2, V2_SYNC)?;
    }
    if version < 3 {
        apply(conn, 3, V3_SETTINGS)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

/// Apply one migration's statements atomically and record its version
fn apply(conn: &mut Connection, version: i32, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version} (target {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: domain tables the sync subsystem reads and writes
const V1_LEDGER: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        currency TEXT NOT NULL DEFAULT 'USD',
        balance REAL NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_accounts_user_updated ON accounts(user_id, updated_at)",
    "CREATE TABLE IF NOT EXISTS categories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('income', 'expense')),
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_categories_user_updated ON categories(user_id, updated_at)",
    "CREATE TABLE IF NOT EXISTS budgets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        category_id INTEGER REFERENCES categories(id),
        name TEXT NOT NULL,
        amount REAL NOT NULL,
        period TEXT NOT NULL DEFAULT 'monthly',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_budgets_user_updated ON budgets(user_id, updated_at)",
    "CREATE TABLE IF NOT EXISTS goals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        target_amount REAL NOT NULL,
        current_amount REAL NOT NULL DEFAULT 0,
        target_date TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_goals_user_updated ON goals(user_id, updated_at)",
    "CREATE TABLE IF NOT EXISTS bills (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        amount REAL NOT NULL,
        due_date TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_bills_user_updated ON bills(user_id, updated_at)",
    "CREATE TABLE IF NOT EXISTS transactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        account_id INTEGER NOT NULL REFERENCES accounts(id),
        category_id INTEGER NOT NULL REFERENCES categories(id),
        amount REAL NOT NULL,
        type TEXT NOT NULL CHECK (type IN ('income', 'expense', 'transfer')),
        date TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        client_id TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_transactions_user_updated ON transactions(user_id, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_user_date ON transactions(user_id, date)",
    // Idempotency key: one applied transaction per (user, client id).
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_user_client
        ON transactions(user_id, client_id) WHERE client_id IS NOT NULL",
];

/// Version 2: sync session log and offline record store
const V2_SYNC: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_sessions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('incremental', 'full')),
        status TEXT NOT NULL CHECK (status IN ('started', 'completed', 'failed')),
        started_at INTEGER NOT NULL,
        completed_at INTEGER,
        items_synced INTEGER NOT NULL DEFAULT 0,
        conflicts INTEGER NOT NULL DEFAULT 0,
        errors INTEGER NOT NULL DEFAULT 0,
        metadata TEXT NOT NULL DEFAULT '{}',
        error_message TEXT,
        CHECK ((status = 'started') = (completed_at IS NULL)),
        CHECK ((status = 'failed') = (error_message IS NOT NULL))
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_sessions_user_status ON sync_sessions(user_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_sync_sessions_user_device_completed
        ON sync_sessions(user_id, device_id, completed_at DESC)",
    "CREATE TABLE IF NOT EXISTS offline_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        client_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        client_created_at INTEGER NOT NULL,
        sync_status TEXT NOT NULL CHECK (sync_status IN ('pending', 'synced', 'conflict')),
        conflict TEXT,
        last_error TEXT,
        transaction_id INTEGER REFERENCES transactions(id),
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        CHECK ((sync_status = 'conflict') = (conflict IS NOT NULL))
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_offline_records_user_client
        ON offline_records(user_id, client_id)",
    "CREATE INDEX IF NOT EXISTS idx_offline_records_user_status
        ON offline_records(user_id, sync_status)",
    "CREATE TABLE IF NOT EXISTS sync_checkpoints (
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        last_sync_at INTEGER NOT NULL,
        session_id TEXT NOT NULL,
        PRIMARY KEY (user_id, device_id)
    )",
];

/// Version 3: typed per-user sync settings
const V3_SETTINGS: &[&str] = &["CREATE TABLE IF NOT EXISTS user_settings (
        user_id TEXT PRIMARY KEY,
        batch_mode TEXT NOT NULL DEFAULT 'isolated' CHECK (batch_mode IN ('isolated', 'atomic')),
        retain_synced_records INTEGER NOT NULL DEFAULT 1,
        initial_transaction_window_months INTEGER NOT NULL DEFAULT 3,
        updated_at INTEGER NOT NULL
    )"];

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_offline_client_id_is_unique_per_user() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let insert = "INSERT INTO offline_records
            (user_id, device_id, client_id, payload, client_created_at, sync_status, created_at, updated_at)
            VALUES (?1, 'dev1', 'abc', '{}', 0, 'pending', 0, 0)";
        conn.execute(insert, ["user-a"]).unwrap();
        conn.execute(insert, ["user-b"]).unwrap();
        assert!(conn.execute(insert, ["user-a"]).is_err());
    }

    #[test]
    fn test_session_status_and_completion_agree() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let result = conn.execute(
            "INSERT INTO sync_sessions (id, user_id, device_id, kind, status, started_at, completed_at)
             VALUES ('s1', 'u', 'd', 'full', 'started', 0, 10)",
            [],
        );
        assert!(result.is_err());
    }
}
