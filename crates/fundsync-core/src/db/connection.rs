//! Database connection management

use crate::error::Result;
use crate::util::observe_millis;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use super::migrations;

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tables whose rows carry an `updated_at` stamp
const STAMPED_TABLES: [&str; 6] = [
    "accounts",
    "categories",
    "budgets",
    "goals",
    "bills",
    "transactions",
];

/// Where the database lives, so more connections can reach it
#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    /// Shared-cache in-memory database, addressed by URI
    Memory(String),
}

/// Database wrapper for a `SQLite` connection
pub struct Database {
    conn: Connection,
    location: Location,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, Location::File(path.to_path_buf()))
    }

    /// Open an in-memory database (useful for testing)
    ///
    /// Every call gets its own database. It lives until the last connection
    /// to it, including readers, is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let uri = format!(
            "file:fundsync-{}?mode=memory&cache=shared",
            Uuid::now_v7().simple()
        );
        let conn = Connection::open_with_flags(&uri, memory_flags())?;
        Self::from_connection(conn, Location::Memory(uri))
    }

    fn from_connection(conn: Connection, location: Location) -> Result<Self> {
        let mut database = Self { conn, location };
        database.configure()?;
        database.migrate()?;
        database.observe_latest_stamp()?;
        Ok(database)
    }

    /// Open a second, read-only connection to the same database.
    ///
    /// Reads on it do not wait for the writer. File databases run in WAL mode
    /// and see the last committed state. In-memory databases share a page
    /// cache, so the reader sees uncommitted writes.
    pub fn open_reader(&self) -> Result<Connection> {
        let conn = match &self.location {
            Location::File(path) => Connection::open(path)?,
            Location::Memory(uri) => {
                let conn = Connection::open_with_flags(uri, memory_flags())?;
                conn.pragma_update(None, "read_uncommitted", "ON")?;
                conn
            }
        };
        conn.pragma_update(None, "query_only", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Configure `SQLite` pragmas
    fn configure(&self) -> Result<()> {
        // In-memory databases reject WAL; that is fine.
        self.conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })
            .ok();
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&mut self) -> Result<()> {
        migrations::run(&mut self.conn)
    }

    /// Keep row stamps issued from now on ahead of every stored one.
    fn observe_latest_stamp(&self) -> Result<()> {
        let stamps: Vec<String> = STAMPED_TABLES
            .iter()
            .map(|table| format!("SELECT MAX(updated_at) FROM {table}"))
            .collect();
        let sql = format!(
            "SELECT MAX(stamp) FROM (SELECT MAX(last_sync_at) AS stamp FROM sync_checkpoints UNION ALL {})",
            stamps.join(" UNION ALL ")
        );
        let latest: Option<i64> = self.conn.query_row(&sql, [], |row| row.get(0))?;
        if let Some(latest) = latest {
            observe_millis(latest);
        }
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, needed to open transactions
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

fn memory_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
}
