//! SQLite-backed ledger store.
//!
//! The database lives at `~/.bookkeeper/ledger.db` unless configured otherwise
//! and exclusively owns all persisted ledger state: accounts, posting headers,
//! journal entries, label extras and the daily aggregates. Every write that
//! must be atomic goes through [`LedgerDb::begin`], which returns a guard that
//! rolls back on drop (including unwinding) unless explicitly committed.

// SQLite stores identifiers as i64; ledger ids are never negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

pub mod accounts;
pub mod daily;
pub mod dispatch_tasks;
pub mod journal;
pub mod transactions;
pub mod types;
pub use types::*;

/// How long a writer waits for another connection's write reservation.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Locking mode for a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxBehavior {
    /// Reserve the write lock at BEGIN; used by every posting envelope.
    Immediate,
    /// Exclude readers and writers; used by resync tooling.
    Exclusive,
}

impl TxBehavior {
    fn begin_sql(&self) -> &'static str {
        match self {
            TxBehavior::Immediate => "BEGIN IMMEDIATE",
            TxBehavior::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

pub struct LedgerDb {
    conn: Connection,
    path: Option<PathBuf>,
}

/// An open ledger transaction. Rolls back on drop unless committed.
pub struct TxGuard<'a> {
    db: &'a LedgerDb,
    finished: bool,
}

impl TxGuard<'_> {
    pub fn commit(mut self) -> Result<(), rusqlite::Error> {
        self.db.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), rusqlite::Error> {
        self.finished = true;
        self.db.conn.execute_batch("ROLLBACK")
    }
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.db.conn.execute_batch("ROLLBACK") {
                log::warn!("LedgerDb: rollback on drop failed: {}", e);
            }
        }
    }
}

impl LedgerDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Filesystem path of the database, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Start a transaction with the given locking mode.
    pub fn begin(&self, behavior: TxBehavior) -> Result<TxGuard<'_>, rusqlite::Error> {
        self.conn.execute_batch(behavior.begin_sql())?;
        Ok(TxGuard {
            db: self,
            finished: false,
        })
    }

    /// Execute a closure within an immediate transaction.
    /// Commits on Ok, rolls back on Err or panic.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let guard = self.begin(TxBehavior::Immediate)?;
        let value = f(self)?;
        guard.commit()?;
        Ok(value)
    }

    /// Open (or create) the ledger at the default path and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        Self::open_at(Self::default_path()?)
    }

    /// Open a ledger at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        crate::migrations::run_migrations(&conn)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// Open a private in-memory ledger. Nothing is shared with other connections.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        crate::migrations::run_migrations(&conn)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Open a second connection to the same file, e.g. for a worker thread.
    pub fn reopen(&self) -> Result<Self, DbError> {
        match &self.path {
            Some(path) => Self::open_at(path.clone()),
            None => Err(DbError::InMemory),
        }
    }

    /// Resolve the default database path: `~/.bookkeeper/ledger.db`.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".bookkeeper").join("ledger.db"))
    }

    /// Id assigned by the most recent INSERT on this connection.
    pub(crate) fn last_id(&self) -> u64 {
        self.conn.last_insert_rowid() as u64
    }
}

pub mod test_utils {
    use super::LedgerDb;

    /// Create a migrated on-disk ledger for tests.
    ///
    /// The `TempDir` is leaked so the file outlives the test body and can be
    /// reopened from a second connection.
    pub fn test_db() -> LedgerDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("ledger.db");
        std::mem::forget(dir);
        LedgerDb::open_at(path).expect("Failed to open test ledger")
    }
}

// =============================================================================
// Tests
// =============================================================================
