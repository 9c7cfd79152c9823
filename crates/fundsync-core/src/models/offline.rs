//! Pending offline record model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{ReferenceState, ReferenceStatus};
use super::transaction::TransactionPayload;
use crate::error::Error;

/// Reconciliation state of a client-submitted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflineStatus {
    /// Not yet applied; last attempt failed unexpectedly
    Pending,
    /// Applied; `transaction_id` is set
    Synced,
    /// Blocked by a conflict awaiting explicit resolution
    Conflict,
}

impl OfflineStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
        }
    }
}

impl fmt::Display for OfflineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OfflineStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            other => Err(Error::InvalidInput(format!("Unknown sync status: {other}"))),
        }
    }
}

/// Why a record diverges from server state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    AccountMissing,
    CategoryMissing,
    AccountNotOwned,
    CategoryNotOwned,
}

impl ConflictReason {
    /// Field of the payload the reason points at.
    pub const fn field(self) -> &'static str {
        match self {
            Self::AccountMissing | Self::AccountNotOwned => "account_id",
            Self::CategoryMissing | Self::CategoryNotOwned => "category_id",
        }
    }

    /// Missing references cannot be applied even when forced.
    pub const fn survives_force(self) -> bool {
        matches!(self, Self::AccountMissing | Self::CategoryMissing)
    }

    /// Derive the reason (if any) for one reference state.
    pub const fn for_account(state: &ReferenceState) -> Option<Self> {
        match state.status {
            ReferenceStatus::Live => None,
            ReferenceStatus::Missing | ReferenceStatus::Deleted => Some(Self::AccountMissing),
            ReferenceStatus::Foreign => Some(Self::AccountNotOwned),
        }
    }

    pub const fn for_category(state: &ReferenceState) -> Option<Self> {
        match state.status {
            ReferenceStatus::Live => None,
            ReferenceStatus::Missing | ReferenceStatus::Deleted => Some(Self::CategoryMissing),
            ReferenceStatus::Foreign => Some(Self::CategoryNotOwned),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::AccountMissing => "account no longer exists",
            Self::CategoryMissing => "category no longer exists",
            Self::AccountNotOwned => "account does not belong to this user",
            Self::CategoryNotOwned => "category does not belong to this user",
        }
    }
}

/// Server-side view of the relations a conflicting record referenced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub account: ReferenceState,
    pub category: ReferenceState,
}

/// Structured explanation attached to a conflicting record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetail {
    pub reasons: Vec<ConflictReason>,
    pub message: String,
    pub server_state: ServerState,
}

impl ConflictDetail {
    pub fn new(reasons: Vec<ConflictReason>, server_state: ServerState) -> Self {
        let message = reasons
            .iter()
            .map(|reason| format!("{} ({})", reason.describe(), reason.field()))
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            reasons,
            message,
            server_state,
        }
    }

    /// Names of the payload fields that diverged, deduplicated.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields: Vec<_> = self.reasons.iter().map(|reason| reason.field()).collect();
        fields.dedup();
        fields
    }
}

/// Client-submitted transaction retained server-side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOfflineRecord {
    pub id: i64,
    pub user_id: String,
    pub device_id: String,
    pub client_id: String,
    pub payload: TransactionPayload,
    pub client_created_at: DateTime<Utc>,
    pub sync_status: OfflineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub transaction_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: i64, status: ReferenceStatus) -> ReferenceState {
        ReferenceState {
            id,
            status,
            deleted_at: None,
        }
    }

    #[test]
    fn reasons_follow_reference_status() {
        assert_eq!(
            ConflictReason::for_account(&state(1, ReferenceStatus::Deleted)),
            Some(ConflictReason::AccountMissing)
        );
        assert_eq!(
            ConflictReason::for_category(&state(2, ReferenceStatus::Foreign)),
            Some(ConflictReason::CategoryNotOwned)
        );
        assert_eq!(
            ConflictReason::for_account(&state(1, ReferenceStatus::Live)),
            None
        );
    }

    #[test]
    fn detail_message_names_fields() {
        let detail = ConflictDetail::new(
            vec![ConflictReason::AccountMissing, ConflictReason::CategoryNotOwned],
            ServerState {
                account: state(5, ReferenceStatus::Missing),
                category: state(2, ReferenceStatus::Foreign),
            },
        );
        assert!(detail.message.contains("account no longer exists (account_id)"));
        assert!(detail.message.contains("category_id"));
        assert_eq!(detail.fields(), vec!["account_id", "category_id"]);
    }

    #[test]
    fn only_missing_references_survive_force() {
        assert!(ConflictReason::AccountMissing.survives_force());
        assert!(!ConflictReason::AccountNotOwned.survives_force());
    }
}
