//! Per-user sync settings repository implementation

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{BatchMode, UserSyncSettings};
use crate::util::now_millis;

/// Trait for settings storage operations
pub trait SettingsRepository {
    /// Load a user's settings, falling back to defaults when none are stored
    fn load(&self, user_id: &str) -> Result<UserSyncSettings>;

    /// Save a user's settings
    fn save(&self, user_id: &str, settings: &UserSyncSettings) -> Result<()>;
}

/// `SQLite` implementation of `SettingsRepository`
pub struct SqliteSettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SettingsRepository for SqliteSettingsRepository<'_> {
    fn load(&self, user_id: &str) -> Result<UserSyncSettings> {
        let settings = self
            .conn
            .query_row(
                "SELECT batch_mode, retain_synced_records, initial_transaction_window_months
                 FROM user_settings WHERE user_id = ?1",
                params![user_id],
                |row| {
                    let batch_mode: String = row.get(0)?;
                    Ok(UserSyncSettings {
                        batch_mode: batch_mode.parse::<BatchMode>().map_err(|error| {
                            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(error))
                        })?,
                        retain_synced_records: row.get(1)?,
                        initial_transaction_window_months: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(settings.unwrap_or_default())
    }

    fn save(&self, user_id: &str, settings: &UserSyncSettings) -> Result<()> {
        settings.validate()?;
        self.conn.execute(
            "INSERT INTO user_settings
                (user_id, batch_mode, retain_synced_records, initial_transaction_window_months, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                batch_mode = excluded.batch_mode,
                retain_synced_records = excluded.retain_synced_records,
                initial_transaction_window_months = excluded.initial_transaction_window_months,
                updated_at = excluded.updated_at",
            params![
                user_id,
                settings.batch_mode.as_str(),
                settings.retain_synced_records,
                settings.initial_transaction_window_months,
                now_millis()
            ],
        )?;
        Ok(())
    }
}
