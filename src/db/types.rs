//! Shared type definitions for the database layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while opening or migrating the ledger database.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("An in-memory ledger cannot be reopened")]
    InMemory,
}

/// Schema upgrade failures. The database is left at the last version that
/// applied cleanly.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("ledger schema v{found} is newer than this build (v{known}); upgrade bookkeeper")]
    NewerSchema { found: i32, known: i32 },

    #[error("snapshot to {path} failed: {source}")]
    Snapshot {
        path: String,
        source: rusqlite::Error,
    },

    #[error("v{version}: {source}")]
    Step {
        version: i32,
        source: rusqlite::Error,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Chart-of-accounts category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coa {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl Coa {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coa::Asset => "asset",
            Coa::Liability => "liability",
            Coa::Equity => "equity",
            Coa::Revenue => "revenue",
            Coa::Expense => "expense",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asset" => Some(Coa::Asset),
            "liability" => Some(Coa::Liability),
            "equity" => Some(Coa::Equity),
            "revenue" => Some(Coa::Revenue),
            "expense" => Some(Coa::Expense),
            _ => None,
        }
    }

    /// The sign convention an account of this category normally carries.
    pub fn natural_balance(&self) -> BalanceType {
        match self {
            Coa::Asset | Coa::Expense => BalanceType::Debit,
            Coa::Liability | Coa::Equity | Coa::Revenue => BalanceType::Credit,
        }
    }
}

/// Whether an account grows with debits or with credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BalanceType {
    #[serde(rename = "d")]
    Debit,
    #[serde(rename = "c")]
    Credit,
}

impl BalanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceType::Debit => "d",
            BalanceType::Credit => "c",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "d" | "debit" => Some(BalanceType::Debit),
            "c" | "credit" => Some(BalanceType::Credit),
            _ => None,
        }
    }

    /// Balance movement produced by a debit/credit pair on an account of this type.
    pub fn balance_delta(&self, debit: f64, credit: f64) -> f64 {
        match self {
            BalanceType::Debit => debit - credit,
            BalanceType::Credit => credit - debit,
        }
    }

    /// Split a signed balance movement into the `(debit, credit)` pair that produces it.
    ///
    /// Positive amounts grow the account, negative amounts shrink it.
    pub fn split_amount(&self, amount: f64) -> (f64, f64) {
        match (self, amount >= 0.0) {
            (BalanceType::Debit, true) => (amount, 0.0),
            (BalanceType::Debit, false) => (0.0, -amount),
            (BalanceType::Credit, true) => (0.0, amount),
            (BalanceType::Credit, false) => (-amount, 0.0),
        }
    }
}

/// A row from the `accounts` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub account_key: String,
    pub team_id: u64,
    pub coa: Coa,
    pub balance_type: BalanceType,
    pub name: String,
    pub can_adjust: bool,
    pub created: DateTime<Utc>,
}

/// A row from the `journal_entries` table.
///
/// `id` is `None` until the builder persists the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Option<u64>,
    pub transaction_id: u64,
    #[serde(default)]
    pub desc: String,
    pub account_id: u64,
    pub team_id: u64,
    #[serde(default)]
    pub created_by_id: u64,
    pub debit: f64,
    pub credit: f64,
    pub entry_time: DateTime<Utc>,
    #[serde(default)]
    pub rollback: bool,
}

/// A row from the `transactions` table (posting header).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub ref_id: String,
    pub team_id: u64,
    pub created_by_id: u64,
    pub desc: String,
    pub created: DateTime<Utc>,
}

/// A row from the `accounting_tags` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: u64,
    pub name: String,
}

/// A row from the `type_labels` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeLabel {
    pub id: u64,
    pub key: String,
    pub label: String,
}

/// One day of an account (optionally label-scoped) daily aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyBalanceRow {
    pub day: DateTime<Utc>,
    pub account_id: u64,
    pub journal_team_id: u64,
    /// Label id for shop/cs/supplier/custom tables, `None` for `account_daily_balances`.
    pub label_id: Option<u64>,
    pub debit: f64,
    pub credit: f64,
    pub balance: f64,
}

/// One day of the account-key aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountKeyDailyBalance {
    pub day: DateTime<Utc>,
    pub account_key: String,
    pub journal_team_id: u64,
    pub debit: f64,
    pub credit: f64,
    pub balance: f64,
    pub start_balance: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_amount_debit_account() {
        assert_eq!(BalanceType::Debit.split_amount(1200.0), (1200.0, 0.0));
        assert_eq!(BalanceType::Debit.split_amount(-1200.0), (0.0, 1200.0));
    }

    #[test]
    fn test_split_amount_credit_account() {
        assert_eq!(BalanceType::Credit.split_amount(50.0), (0.0, 50.0));
        assert_eq!(BalanceType::Credit.split_amount(-50.0), (50.0, 0.0));
    }

    #[test]
    fn test_balance_delta_signs() {
        assert_eq!(BalanceType::Debit.balance_delta(0.0, 1200.0), -1200.0);
        assert_eq!(BalanceType::Credit.balance_delta(0.0, 1200.0), 1200.0);
    }

    #[test]
    fn test_coa_round_trip_and_natural_balance() {
        for coa in [Coa::Asset, Coa::Liability, Coa::Equity, Coa::Revenue, Coa::Expense] {
            assert_eq!(Coa::parse(coa.as_str()), Some(coa));
        }
        assert_eq!(Coa::Expense.natural_balance(), BalanceType::Debit);
        assert_eq!(Coa::Revenue.natural_balance(), BalanceType::Credit);
    }

    #[test]
    fn test_journal_entry_wire_shape() {
        let json = r#"{
            "id": 7, "transaction_id": 3, "desc": "sale", "account_id": 11,
            "team_id": 1, "debit": 0.0, "credit": 1200.0,
            "entry_time": "2024-05-01T03:00:00Z", "rollback": false
        }"#;
        let entry: JournalEntry = serde_json::from_str(json).expect("decode");
        assert_eq!(entry.id, Some(7));
        assert_eq!(entry.created_by_id, 0);
        assert_eq!(entry.credit, 1200.0);
    }
}
