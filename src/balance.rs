//! Read side: balances and reports served from the daily aggregates.
//!
//! Balance and label queries read one row per day (per label), never the
//! raw journal. Journal lookups by reference are here too since they share
//! the callers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::accounts::AccountRegistry;
use crate::db::daily::DailyTable;
use crate::db::{DailyBalanceRow, JournalEntry, LedgerDb, Transaction};
use crate::entry::{change_map, ChangeMap};
use crate::error::LedgerError;
use crate::util::{book_day, round_to_precision, BALANCE_PRECISION};

/// Balance of one account as booked by one team.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBalance {
    pub account_id: u64,
    pub team_id: u64,
    /// Book day the balance is closed at.
    pub as_of: DateTime<Utc>,
    pub debit: f64,
    pub credit: f64,
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelTotal {
    pub label_id: u64,
    pub balance: f64,
}

/// Closing balance at the end of the book day containing `as_of`.
pub fn account_balance(
    db: &LedgerDb,
    account_id: u64,
    team_id: u64,
    as_of: DateTime<Utc>,
) -> Result<AccountBalance, LedgerError> {
    let day = book_day(as_of);
    let (debit, credit, balance) =
        db.sum_daily_balances(DailyTable::Account, account_id, team_id, day)?;
    Ok(AccountBalance {
        account_id,
        team_id,
        as_of: day,
        debit: round_to_precision(debit, BALANCE_PRECISION),
        credit: round_to_precision(credit, BALANCE_PRECISION),
        balance: round_to_precision(balance, BALANCE_PRECISION),
    })
}

/// [`account_balance`] for a reserved key of the team.
pub fn account_balance_by_key(
    db: &LedgerDb,
    account_key: &str,
    team_id: u64,
    as_of: DateTime<Utc>,
) -> Result<AccountBalance, LedgerError> {
    let account = AccountRegistry::new().resolve(db, account_key, team_id, false)?;
    account_balance(db, account.id, team_id, as_of)
}

/// Per-day movement of an account between two instants, oldest first.
/// Days without movement are absent.
pub fn daily_series(
    db: &LedgerDb,
    account_id: u64,
    team_id: u64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<DailyBalanceRow>, LedgerError> {
    Ok(db.get_daily_balances(
        DailyTable::Account,
        account_id,
        team_id,
        book_day(from),
        book_day(to),
    )?)
}

/// Movement of an account broken down by one label dimension.
pub fn label_totals(
    db: &LedgerDb,
    table: DailyTable,
    account_id: u64,
    team_id: u64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<LabelTotal>, LedgerError> {
    let totals = db.sum_label_balances(table, account_id, team_id, book_day(from), book_day(to))?;
    Ok(totals
        .into_iter()
        .map(|(label_id, balance)| LabelTotal {
            label_id,
            balance: round_to_precision(balance, BALANCE_PRECISION),
        })
        .collect())
}

/// Closing balance of a reserved key at the book day containing `as_of`.
/// Zero when nothing was booked on or before that day.
pub fn account_key_closing(
    db: &LedgerDb,
    account_key: &str,
    team_id: u64,
    as_of: DateTime<Utc>,
) -> Result<f64, LedgerError> {
    Ok(db
        .get_account_key_closing(account_key, team_id, book_day(as_of))?
        .map(|row| round_to_precision(row.balance, BALANCE_PRECISION))
        .unwrap_or(0.0))
}

fn find_by_ref(db: &LedgerDb, ref_id: &str) -> Result<Transaction, LedgerError> {
    db.find_transaction_by_ref(ref_id)?
        .ok_or_else(|| LedgerError::TransactionNotFound(ref_id.to_string()))
}

/// Every journal row of a posting, reversals included.
pub fn transaction_entries(db: &LedgerDb, ref_id: &str) -> Result<Vec<JournalEntry>, LedgerError> {
    let transaction = find_by_ref(db, ref_id)?;
    Ok(db.get_transaction_entries(transaction.id)?)
}

/// Net per-account change of a posting.
pub fn transaction_change_map(db: &LedgerDb, ref_id: &str) -> Result<ChangeMap, LedgerError> {
    let entries = transaction_entries(db, ref_id)?;
    let registry = AccountRegistry::new();
    change_map(&entries, |id| registry.load(db, id))
}
