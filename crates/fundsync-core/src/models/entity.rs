//! Domain entity kinds exchanged during full sync

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Domain entity kinds a device can pull
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Accounts,
    Categories,
    Budgets,
    Goals,
    Bills,
    Transactions,
}

impl EntityKind {
    /// Every kind, in the order full sync walks them.
    pub const ALL: [Self; 6] = [
        Self::Accounts,
        Self::Categories,
        Self::Budgets,
        Self::Goals,
        Self::Bills,
        Self::Transactions,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Categories => "categories",
            Self::Budgets => "budgets",
            Self::Goals => "goals",
            Self::Bills => "bills",
            Self::Transactions => "transactions",
        }
    }

    /// Backing table name. Kinds map one-to-one onto tables.
    pub const fn table(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidInput(format!("Unknown entity kind: {s}")))
    }
}

/// Identifier of a row soft-deleted after a device's checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedEntity {
    pub kind: EntityKind,
    pub id: i64,
    pub deleted_at: DateTime<Utc>,
}

/// How a referenced row looks from the requesting user's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceStatus {
    /// Exists, not deleted, owned by the user
    Live,
    /// No row with this id
    Missing,
    /// Soft-deleted
    Deleted,
    /// Exists but belongs to another user
    Foreign,
}

/// Server-observed state of a foreign key a client record points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceState {
    pub id: i64,
    pub status: ReferenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ReferenceState {
    pub const fn exists(&self) -> bool {
        matches!(self.status, ReferenceStatus::Live | ReferenceStatus::Foreign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_parses_case_insensitively() {
        assert_eq!("Accounts".parse::<EntityKind>().unwrap(), EntityKind::Accounts);
        assert_eq!(" bills ".parse::<EntityKind>().unwrap(), EntityKind::Bills);
        assert!("debts".parse::<EntityKind>().is_err());
    }

    #[test]
    fn entity_kind_serializes_lowercase() {
        let json = serde_json::to_string(&EntityKind::Goals).unwrap();
        assert_eq!(json, "\"goals\"");
    }
}
