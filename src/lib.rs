//! Multi-tenant double-entry ledger kernel.
//!
//! Postings are written through an [`envelope::Envelope`]: one database
//! transaction holding a posting header, its balanced journal entries, and
//! the daily-aggregate update dispatched to the configured handlers.

pub mod accounts;
pub mod aggregator;
pub mod balance;
pub mod config;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod dispatch_queue;
pub mod entry;
pub mod envelope;
pub mod error;
pub mod labels;
mod migrations;
pub mod mutation;
pub mod refid;
pub mod resync;
pub mod setup;
pub mod util;

pub use context::Context;
pub use db::LedgerDb;
pub use envelope::{BookManage, Committed, Envelope};
pub use error::{LedgerError, LedgerResult};
