use rusqlite::{params, Row};

use super::*;
use crate::util::{parse_time_column, to_db_time};

const ENTRY_COLUMNS: &str = "id, transaction_id, description, account_id, team_id, created_by_id, \
     debit, credit, entry_time, rollback";

impl LedgerDb {
    // =========================================================================
    // Journal entries
    // =========================================================================

    /// Persist a batch of entries in order, filling in each entry's id.
    ///
    /// Callers run this inside an open transaction; the batch is not atomic on
    /// its own.
    pub fn insert_journal_entries(
        &self,
        entries: &mut [JournalEntry],
    ) -> Result<(), rusqlite::Error> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO journal_entries (
                transaction_id, description, account_id, team_id, created_by_id,
                debit, credit, entry_time, rollback
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for entry in entries.iter_mut() {
            stmt.execute(params![
                entry.transaction_id as i64,
                entry.desc,
                entry.account_id as i64,
                entry.team_id as i64,
                entry.created_by_id as i64,
                entry.debit,
                entry.credit,
                to_db_time(entry.entry_time),
                entry.rollback as i32,
            ])?;
            entry.id = Some(self.last_id());
        }
        Ok(())
    }

    /// All entries of a posting, in insertion order.
    pub fn get_transaction_entries(
        &self,
        transaction_id: u64,
    ) -> Result<Vec<JournalEntry>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM journal_entries WHERE transaction_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![transaction_id as i64], Self::map_entry_row)?;
        rows.collect()
    }

    /// Entries whose id is greater than `after_id`, oldest first. Used by
    /// rebuild tooling that walks the journal in chunks.
    pub fn get_entries_after(
        &self,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM journal_entries WHERE id > ?1 ORDER BY id LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![after_id as i64, limit as i64], Self::map_entry_row)?;
        rows.collect()
    }

    pub fn count_journal_entries(&self) -> Result<u64, rusqlite::Error> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM journal_entries", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Raw `(Σdebit, Σcredit)` for one account as booked by one team.
    pub fn sum_account_entries(
        &self,
        account_id: u64,
        team_id: u64,
    ) -> Result<(f64, f64), rusqlite::Error> {
        self.conn.query_row(
            "SELECT COALESCE(SUM(debit), 0), COALESCE(SUM(credit), 0)
             FROM journal_entries WHERE account_id = ?1 AND team_id = ?2",
            params![account_id as i64, team_id as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
    }

    fn map_entry_row(row: &Row<'_>) -> rusqlite::Result<JournalEntry> {
        let entry_time: String = row.get(8)?;
        Ok(JournalEntry {
            id: Some(row.get::<_, i64>(0)? as u64),
            transaction_id: row.get::<_, i64>(1)? as u64,
            desc: row.get(2)?,
            account_id: row.get::<_, i64>(3)? as u64,
            team_id: row.get::<_, i64>(4)? as u64,
            created_by_id: row.get::<_, i64>(5)? as u64,
            debit: row.get(6)?,
            credit: row.get(7)?,
            entry_time: parse_time_column(8, &entry_time)?,
            rollback: row.get::<_, i32>(9)? != 0,
        })
    }
}
