//! Database layer for fundsync

mod connection;
mod ledger_repository;
mod migrations;
mod offline_repository;
mod session_repository;
mod settings_repository;

pub use connection::Database;
pub use ledger_repository::{LedgerRepository, SqliteLedgerRepository};
pub use offline_repository::{
    OfflineCounts, OfflineEntry, OfflineRecordRepository, SqliteOfflineRecordRepository,
};
pub use session_repository::{SessionRepository, SqliteSessionRepository};
pub use settings_repository::{SettingsRepository, SqliteSettingsRepository};
