//! fundsync-core - Core library for fundsync
//!
//! This crate contains the models, `SQLite` storage layer, and the offline
//! transaction sync engine used by the fundsync API server.

pub mod db;
pub mod error;
pub mod models;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{SessionId, SyncSession, UserSyncSettings};
pub use sync::SyncService;
