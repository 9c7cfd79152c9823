//! Per-user sync settings model

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How a batch of offline transactions reacts to an unexpected per-record error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    /// Each record commits on its own; failures are reported per record
    #[default]
    Isolated,
    /// Any failure rolls back the whole batch
    Atomic,
}

impl BatchMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Isolated => "isolated",
            Self::Atomic => "atomic",
        }
    }
}

impl FromStr for BatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolated" => Ok(Self::Isolated),
            "atomic" => Ok(Self::Atomic),
            other => Err(Error::InvalidInput(format!("Unknown batch mode: {other}"))),
        }
    }
}

/// Sync behavior settings, loaded once per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSyncSettings {
    /// Default batch mode when a request does not ask for strict atomicity
    pub batch_mode: BatchMode,
    /// Keep offline records around after they sync
    pub retain_synced_records: bool,
    /// How far back a first full sync reaches for transactions
    pub initial_transaction_window_months: u32,
}

impl Default for UserSyncSettings {
    fn default() -> Self {
        Self {
            batch_mode: BatchMode::Isolated,
            retain_synced_records: true,
            initial_transaction_window_months: 3,
        }
    }
}

impl UserSyncSettings {
    /// Bounds accepted for the initial transaction window.
    pub const WINDOW_MONTHS_RANGE: std::ops::RangeInclusive<u32> = 1..=120;

    pub fn validate(&self) -> Result<(), Error> {
        if Self::WINDOW_MONTHS_RANGE.contains(&self.initial_transaction_window_months) {
            Ok(())
        } else {
            Err(Error::InvalidInput(
                "initial_transaction_window_months must be in [1, 120]".to_string(),
            ))
        }
    }
}
