//! Client-chosen conflict resolutions

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::transaction::{TransactionPayload, TransactionType};

/// One resolution request, tagged by `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Apply the client's record as submitted, overriding ownership checks
    UseClient { conflict_id: i64 },
    /// Keep server state and discard the client's record
    UseServer { conflict_id: i64 },
    /// Overlay corrected fields onto the client's record and retry
    Merge { conflict_id: i64, data: MergeFields },
}

impl ConflictResolution {
    pub const fn conflict_id(&self) -> i64 {
        match self {
            Self::UseClient { conflict_id }
            | Self::UseServer { conflict_id }
            | Self::Merge { conflict_id, .. } => *conflict_id,
        }
    }

    pub const fn action(&self) -> &'static str {
        match self {
            Self::UseClient { .. } => "use_client",
            Self::UseServer { .. } => "use_server",
            Self::Merge { .. } => "merge",
        }
    }
}

/// Fields a merge may replace; absent fields keep the client's value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeFields {
    #[serde(default)]
    pub account_id: Option<i64>,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default, rename = "type")]
    pub kind: Option<TransactionType>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub description: Option<String>,
}

impl MergeFields {
    pub const fn is_empty(&self) -> bool {
        self.account_id.is_none()
            && self.category_id.is_none()
            && self.amount.is_none()
            && self.kind.is_none()
            && self.date.is_none()
            && self.description.is_none()
    }

    /// Produce the merged payload.
    #[must_use]
    pub fn apply_to(&self, base: &TransactionPayload) -> TransactionPayload {
        TransactionPayload {
            account_id: self.account_id.unwrap_or(base.account_id),
            category_id: self.category_id.unwrap_or(base.category_id),
            amount: self.amount.unwrap_or(base.amount),
            kind: self.kind.unwrap_or(base.kind),
            date: self.date.unwrap_or(base.date),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| base.description.clone()),
        }
    }
}
