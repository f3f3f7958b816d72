//! Error types for the bookkeeping kernel.
//!
//! Errors are classified by who can act on them:
//! - Validation: the caller built an invalid posting (zero amount, unbalanced, unknown account)
//! - Sentinel: `SkipTransaction` is not a failure, it asks the envelope to commit quietly
//! - Storage: SQLite failures, surfaced unchanged except for unique-key violations
//! - Dispatch: after-commit aggregation could not be delivered

use thiserror::Error;

use crate::db::{DbError, JournalEntry};

/// Errors raised by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    // Validation errors
    #[error("amount must not be zero")]
    ZeroAmount,

    #[error("no journal entries to commit")]
    EmptyEntry,

    #[error("journal entries are not balanced: debit {debit} != credit {credit} (precision {precision})")]
    EntryInvalid {
        debit: f64,
        credit: f64,
        entries: Vec<JournalEntry>,
        precision: u32,
    },

    #[error("account {key} not found for team {team_id}")]
    AccountNotFound { key: String, team_id: u64 },

    #[error("account id {0} not found")]
    AccountIdNotFound(u64),

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("transaction not loaded")]
    TransactionNotLoaded,

    #[error("account {key} already exists for team {team_id}")]
    DuplicateAccount { key: String, team_id: u64 },

    #[error("transaction with ref id {0} already exists")]
    DuplicateRefId(String),

    #[error("cannot transfer between the same account")]
    SameAccountTransfer,

    #[error("invalid ref id: {0}")]
    InvalidRefId(String),

    // Envelope contract
    #[error("transaction skipped")]
    SkipTransaction,

    #[error("envelope committed no journal entries")]
    EntriesEmpty,

    #[error("journal entry for account {account_id} was not persisted")]
    EntryUnpersisted { account_id: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("forbidden: {0}")]
    Forbidden(String),

    // Infrastructure
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database open failed: {0}")]
    Open(#[from] DbError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// True for the idempotence sentinel returned by envelope handlers.
    pub fn is_skip(&self) -> bool {
        matches!(self, LedgerError::SkipTransaction)
    }

    /// True when a lookup found nothing, as opposed to failing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::TransactionNotFound(_)
                | LedgerError::AccountNotFound { .. }
                | LedgerError::AccountIdNotFound(_)
        )
    }

    /// True for errors the caller caused and can fix by changing the request.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::ZeroAmount
                | LedgerError::EmptyEntry
                | LedgerError::EntryInvalid { .. }
                | LedgerError::AccountNotFound { .. }
                | LedgerError::AccountIdNotFound(_)
                | LedgerError::TransactionNotFound(_)
                | LedgerError::TransactionNotLoaded
                | LedgerError::DuplicateAccount { .. }
                | LedgerError::DuplicateRefId(_)
                | LedgerError::SameAccountTransfer
                | LedgerError::InvalidRefId(_)
        )
    }
}

/// Errors raised while handing a daily-update payload to a handler.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("aggregator responded {status}: {message}")]
    Status { status: u16, message: String },

    #[error("queue: {0}")]
    Queue(String),

    #[error("aggregation: {0}")]
    Aggregate(String),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// True when a SQLite error is a UNIQUE or PRIMARY KEY violation.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
