//! Financial-transaction payloads submitted by offline devices

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted client id
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// Longest accepted transaction description
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Direction of money movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Income,
    Expense,
    Transfer,
}

impl TransactionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
            Self::Transfer => "transfer",
        }
    }

    /// Signed effect of `amount` on the owning account's balance.
    pub fn balance_delta(self, amount: f64) -> f64 {
        match self {
            Self::Income => amount,
            Self::Expense => -amount,
            Self::Transfer => 0.0,
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            "transfer" => Ok(Self::Transfer),
            other => Err(Error::InvalidInput(format!(
                "Unknown transaction type: {other}"
            ))),
        }
    }
}

/// Proposed transaction fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub account_id: i64,
    pub category_id: i64,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub date: NaiveDate,
    #[serde(default)]
    pub description: String,
}

impl TransactionPayload {
    /// Record-level checks that do not need the database.
    pub fn validate(&self) -> Result<()> {
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(Error::InvalidInput(
                "amount must be a positive number".to_string(),
            ));
        }
        if self.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(Error::InvalidInput(format!(
                "description must be at most {MAX_DESCRIPTION_LEN} characters"
            )));
        }
        Ok(())
    }
}

/// One locally-created transaction as submitted by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineTransaction {
    pub client_id: String,
    pub data: TransactionPayload,
    pub created_at: DateTime<Utc>,
}

impl OfflineTransaction {
    pub fn validate(&self) -> Result<()> {
        let client_id = self.client_id.trim();
        if client_id.is_empty() {
            return Err(Error::InvalidInput("client_id must not be empty".to_string()));
        }
        if client_id != self.client_id {
            return Err(Error::InvalidInput(
                "client_id must not have leading or trailing whitespace".to_string(),
            ));
        }
        if client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(Error::InvalidInput(format!(
                "client_id must be at most {MAX_CLIENT_ID_LEN} bytes"
            )));
        }
        self.data.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lunch() -> OfflineTransaction {
        serde_json::from_value(serde_json::json!({
            "client_id": "abc",
            "data": {
                "account_id": 5,
                "category_id": 2,
                "amount": 100,
                "type": "expense",
                "date": "2024-01-15",
                "description": "Lunch"
            },
            "created_at": "2024-01-15T12:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn parses_wire_shape() {
        let record = lunch();
        assert_eq!(record.client_id, "abc");
        assert_eq!(record.data.kind, TransactionType::Expense);
        assert_eq!(record.data.date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert!(record.validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_amount() {
        let mut record = lunch();
        record.data.amount = 0.0;
        assert!(record.validate().is_err());
        record.data.amount = f64::NAN;
        assert!(record.validate().is_err());
    }

    #[test]
    fn rejects_blank_client_id() {
        let mut record = lunch();
        record.client_id = "  ".to_string();
        let err = record.validate().unwrap_err();
        assert!(err.to_string().contains("client_id"));
    }

    #[test]
    fn rejects_padded_client_id() {
        for padded in [" abc", "abc ", "\tabc\n"] {
            let mut record = lunch();
            record.client_id = padded.to_string();
            let err = record.validate().unwrap_err();
            assert!(err.to_string().contains("whitespace"), "{padded:?}: {err}");
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let result = serde_json::from_value::<TransactionPayload>(serde_json::json!({
            "account_id": 1,
            "category_id": 1,
            "amount": 1,
            "type": "refund",
            "date": "2024-01-15"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn balance_delta_follows_direction() {
        assert!((TransactionType::Expense.balance_delta(10.0) + 10.0).abs() < f64::EPSILON);
        assert!((TransactionType::Income.balance_delta(10.0) - 10.0).abs() < f64::EPSILON);
        assert!(TransactionType::Transfer.balance_delta(10.0).abs() < f64::EPSILON);
    }
}
