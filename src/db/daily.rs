//! Daily aggregate tables.
//!
//! Five tables share the `(day, account_id, journal_team_id)` key, four of them
//! extended by one label column. [`DailyBucket`] names the table a movement
//! lands in and carries the label id; the SQL for each table is derived from
//! the variant. `account_key_daily_balances` has a different key and stores a
//! cumulative balance, so it has its own functions.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::util::{parse_time_column, to_db_time};

/// Which daily table a movement is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DailyBucket {
    Account,
    Shop(u64),
    CustomerService(u64),
    Supplier(u64),
    CustomLabel(u64),
}

/// Table family of a bucket, without the label id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DailyTable {
    Account,
    Shop,
    CustomerService,
    Supplier,
    CustomLabel,
}

impl DailyTable {
    pub const ALL: [DailyTable; 5] = [
        DailyTable::Account,
        DailyTable::Shop,
        DailyTable::CustomerService,
        DailyTable::Supplier,
        DailyTable::CustomLabel,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            DailyTable::Account => "account_daily_balances",
            DailyTable::Shop => "shop_daily_balances",
            DailyTable::CustomerService => "cs_daily_balances",
            DailyTable::Supplier => "supplier_daily_balances",
            DailyTable::CustomLabel => "custom_label_daily_balances",
        }
    }

    pub fn label_column(&self) -> Option<&'static str> {
        match self {
            DailyTable::Account => None,
            DailyTable::Shop => Some("shop_id"),
            DailyTable::CustomerService => Some("cs_id"),
            DailyTable::Supplier => Some("supplier_id"),
            DailyTable::CustomLabel => Some("custom_id"),
        }
    }

    /// Build the bucket for this table with a label id. `Account` ignores the id.
    pub fn bucket(&self, label_id: u64) -> DailyBucket {
        match self {
            DailyTable::Account => DailyBucket::Account,
            DailyTable::Shop => DailyBucket::Shop(label_id),
            DailyTable::CustomerService => DailyBucket::CustomerService(label_id),
            DailyTable::Supplier => DailyBucket::Supplier(label_id),
            DailyTable::CustomLabel => DailyBucket::CustomLabel(label_id),
        }
    }
}

impl DailyBucket {
    pub fn table(&self) -> DailyTable {
        match self {
            DailyBucket::Account => DailyTable::Account,
            DailyBucket::Shop(_) => DailyTable::Shop,
            DailyBucket::CustomerService(_) => DailyTable::CustomerService,
            DailyBucket::Supplier(_) => DailyTable::Supplier,
            DailyBucket::CustomLabel(_) => DailyTable::CustomLabel,
        }
    }

    pub fn label_id(&self) -> Option<u64> {
        match self {
            DailyBucket::Account => None,
            DailyBucket::Shop(id)
            | DailyBucket::CustomerService(id)
            | DailyBucket::Supplier(id)
            | DailyBucket::CustomLabel(id) => Some(*id),
        }
    }
}

/// Additive movement applied to one daily row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyDelta {
    pub day: DateTime<Utc>,
    pub account_id: u64,
    pub journal_team_id: u64,
    pub debit: f64,
    pub credit: f64,
    pub balance: f64,
}

/// Upsert statement for one table: insert the delta or add it to the existing row.
fn upsert_sql(table: DailyTable) -> String {
    match table.label_column() {
        None => format!(
            "INSERT INTO {t} (day, account_id, journal_team_id, debit, credit, balance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(day, account_id, journal_team_id) DO UPDATE SET
                debit = debit + excluded.debit,
                credit = credit + excluded.credit,
                balance = balance + excluded.balance",
            t = table.table()
        ),
        Some(col) => format!(
            "INSERT INTO {t} (day, account_id, journal_team_id, {col}, debit, credit, balance)
             VALUES (?1, ?2, ?3, ?7, ?4, ?5, ?6)
             ON CONFLICT(day, account_id, journal_team_id, {col}) DO UPDATE SET
                debit = debit + excluded.debit,
                credit = credit + excluded.credit,
                balance = balance + excluded.balance",
            t = table.table()
        ),
    }
}

fn select_sql(table: DailyTable, filter: &str) -> String {
    let label = table.label_column().unwrap_or("NULL");
    format!(
        "SELECT day, account_id, journal_team_id, {label}, debit, credit, balance
         FROM {t} WHERE {filter} ORDER BY day",
        t = table.table()
    )
}

fn map_daily_row(row: &Row<'_>) -> rusqlite::Result<DailyBalanceRow> {
    let day: String = row.get(0)?;
    Ok(DailyBalanceRow {
        day: parse_time_column(0, &day)?,
        account_id: row.get::<_, i64>(1)? as u64,
        journal_team_id: row.get::<_, i64>(2)? as u64,
        label_id: row.get::<_, Option<i64>>(3)?.map(|id| id as u64),
        debit: row.get(4)?,
        credit: row.get(5)?,
        balance: row.get(6)?,
    })
}

fn map_account_key_row(row: &Row<'_>) -> rusqlite::Result<AccountKeyDailyBalance> {
    let day: String = row.get(0)?;
    Ok(AccountKeyDailyBalance {
        day: parse_time_column(0, &day)?,
        account_key: row.get(1)?,
        journal_team_id: row.get::<_, i64>(2)? as u64,
        debit: row.get(3)?,
        credit: row.get(4)?,
        balance: row.get(5)?,
        start_balance: row.get(6)?,
    })
}

/// SQL expression truncating a stored timestamp to its book day, in the same
/// text form as `to_db_time`. Binds `?1` (to local) and `?2` (back to UTC).
fn book_day_sql(column: &str) -> String {
    format!("strftime('%Y-%m-%dT%H:%M:%S', {column}, ?1, 'start of day', ?2) || '.000000Z'")
}

fn to_modifier(offset_secs: i32) -> String {
    format!("{:+} seconds", offset_secs)
}

impl LedgerDb {
    // =========================================================================
    // Label-keyed daily tables
    // =========================================================================

    /// Add a movement to a daily row, creating the row on first use.
    pub fn upsert_daily_balance(
        &self,
        bucket: DailyBucket,
        delta: &DailyDelta,
    ) -> Result<(), rusqlite::Error> {
        let mut stmt = self.conn.prepare_cached(&upsert_sql(bucket.table()))?;
        let day = to_db_time(delta.day);
        match bucket.label_id() {
            None => stmt.execute(params![
                day,
                delta.account_id as i64,
                delta.journal_team_id as i64,
                delta.debit,
                delta.credit,
                delta.balance,
            ])?,
            Some(label) => stmt.execute(params![
                day,
                delta.account_id as i64,
                delta.journal_team_id as i64,
                delta.debit,
                delta.credit,
                delta.balance,
                label as i64,
            ])?,
        };
        Ok(())
    }

    /// One daily row, if present.
    pub fn get_daily_balance(
        &self,
        bucket: DailyBucket,
        day: DateTime<Utc>,
        account_id: u64,
        journal_team_id: u64,
    ) -> Result<Option<DailyBalanceRow>, rusqlite::Error> {
        let table = bucket.table();
        let label_filter = table
            .label_column()
            .map(|col| format!(" AND {col} = ?4"))
            .unwrap_or_default();
        let sql = select_sql(
            table,
            &format!("day = ?1 AND account_id = ?2 AND journal_team_id = ?3{label_filter}"),
        );
        let day = to_db_time(day);
        match bucket.label_id() {
            None => self
                .conn
                .query_row(
                    &sql,
                    params![day, account_id as i64, journal_team_id as i64],
                    map_daily_row,
                )
                .optional(),
            Some(label) => self
                .conn
                .query_row(
                    &sql,
                    params![day, account_id as i64, journal_team_id as i64, label as i64],
                    map_daily_row,
                )
                .optional(),
        }
    }

    /// Daily rows of an account booked by one team, within `[from, to]`, oldest first.
    ///
    /// For label tables every label's rows are returned; callers filter or
    /// group by `label_id`.
    pub fn get_daily_balances(
        &self,
        table: DailyTable,
        account_id: u64,
        journal_team_id: u64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DailyBalanceRow>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&select_sql(
            table,
            "account_id = ?1 AND journal_team_id = ?2 AND day >= ?3 AND day <= ?4",
        ))?;
        let rows = stmt.query_map(
            params![
                account_id as i64,
                journal_team_id as i64,
                to_db_time(from),
                to_db_time(to)
            ],
            map_daily_row,
        )?;
        rows.collect()
    }

    /// `(Σdebit, Σcredit, Σbalance)` of daily rows up to and including `until`.
    pub fn sum_daily_balances(
        &self,
        table: DailyTable,
        account_id: u64,
        journal_team_id: u64,
        until: DateTime<Utc>,
    ) -> Result<(f64, f64, f64), rusqlite::Error> {
        self.conn.query_row(
            &format!(
                "SELECT COALESCE(SUM(debit), 0), COALESCE(SUM(credit), 0), COALESCE(SUM(balance), 0)
                 FROM {} WHERE account_id = ?1 AND journal_team_id = ?2 AND day <= ?3",
                table.table()
            ),
            params![account_id as i64, journal_team_id as i64, to_db_time(until)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
    }

    /// Per-label `(label_id, Σbalance)` for one account over `[from, to]`.
    pub fn sum_label_balances(
        &self,
        table: DailyTable,
        account_id: u64,
        journal_team_id: u64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(u64, f64)>, rusqlite::Error> {
        let Some(col) = table.label_column() else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {col}, SUM(balance) FROM {t}
             WHERE account_id = ?1 AND journal_team_id = ?2 AND day >= ?3 AND day <= ?4
             GROUP BY {col} ORDER BY {col}",
            t = table.table()
        ))?;
        let rows = stmt.query_map(
            params![
                account_id as i64,
                journal_team_id as i64,
                to_db_time(from),
                to_db_time(to)
            ],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, f64>(1)?)),
        )?;
        rows.collect()
    }

    /// Remove every row of a daily table. Rebuild tooling only.
    pub fn clear_daily_table(&self, table: DailyTable) -> Result<usize, rusqlite::Error> {
        self.conn.execute(&format!("DELETE FROM {}", table.table()), [])
    }

    // =========================================================================
    // Account-key aggregate (cumulative)
    // =========================================================================

    /// Fold a movement into the account-key aggregate.
    ///
    /// `balance` on this table is the closing balance of the day and
    /// `start_balance` the closing balance of the previous stored day, so a
    /// new row opens from its predecessor and every later day is shifted by
    /// the same movement.
    pub fn apply_account_key_movement(
        &self,
        day: DateTime<Utc>,
        account_key: &str,
        journal_team_id: u64,
        debit: f64,
        credit: f64,
        balance_delta: f64,
    ) -> Result<(), rusqlite::Error> {
        let day = to_db_time(day);
        self.conn.execute(
            "INSERT INTO account_key_daily_balances
                (day, account_key, journal_team_id, debit, credit, balance, start_balance)
             VALUES (?1, ?2, ?3, ?4, ?5,
                COALESCE((SELECT balance FROM account_key_daily_balances
                          WHERE account_key = ?2 AND journal_team_id = ?3 AND day < ?1
                          ORDER BY day DESC LIMIT 1), 0) + ?6,
                COALESCE((SELECT balance FROM account_key_daily_balances
                          WHERE account_key = ?2 AND journal_team_id = ?3 AND day < ?1
                          ORDER BY day DESC LIMIT 1), 0))
             ON CONFLICT(day, account_key, journal_team_id) DO UPDATE SET
                debit = debit + excluded.debit,
                credit = credit + excluded.credit,
                balance = balance + ?6",
            params![day, account_key, journal_team_id as i64, debit, credit, balance_delta],
        )?;
        self.conn.execute(
            "UPDATE account_key_daily_balances
             SET balance = balance + ?4, start_balance = start_balance + ?4
             WHERE account_key = ?1 AND journal_team_id = ?2 AND day > ?3",
            params![account_key, journal_team_id as i64, day, balance_delta],
        )?;
        Ok(())
    }

    /// Account-key rows of one team, oldest first.
    pub fn get_account_key_balances(
        &self,
        account_key: &str,
        journal_team_id: u64,
    ) -> Result<Vec<AccountKeyDailyBalance>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT day, account_key, journal_team_id, debit, credit, balance, start_balance
             FROM account_key_daily_balances
             WHERE account_key = ?1 AND journal_team_id = ?2 ORDER BY day",
        )?;
        let rows = stmt.query_map(params![account_key, journal_team_id as i64], map_account_key_row)?;
        rows.collect()
    }

    /// Latest account-key row on or before `day`.
    pub fn get_account_key_closing(
        &self,
        account_key: &str,
        journal_team_id: u64,
        day: DateTime<Utc>,
    ) -> Result<Option<AccountKeyDailyBalance>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT day, account_key, journal_team_id, debit, credit, balance, start_balance
                 FROM account_key_daily_balances
                 WHERE account_key = ?1 AND journal_team_id = ?2 AND day <= ?3
                 ORDER BY day DESC LIMIT 1",
                params![account_key, journal_team_id as i64, to_db_time(day)],
                map_account_key_row,
            )
            .optional()
    }

    // =========================================================================
    // Account-key resync (run under an exclusive transaction)
    // =========================================================================

    /// Recompute every account-key row from the journal and overwrite
    /// `debit`, `credit` and the running `balance`. `start_balance` is left
    /// for [`LedgerDb::recompute_account_key_start_balances`].
    ///
    /// `offset_secs` is the book timezone's UTC offset; entries are bucketed
    /// by local midnight expressed back in UTC.
    pub fn resync_account_key_rows(&self, offset_secs: i32) -> Result<usize, rusqlite::Error> {
        let sql = format!(
            "WITH movements AS (
                SELECT {day} AS day,
                       a.account_key AS account_key,
                       je.team_id AS journal_team_id,
                       SUM(je.debit) AS debit,
                       SUM(je.credit) AS credit,
                       SUM(CASE a.balance_type
                               WHEN 'd' THEN je.debit - je.credit
                               ELSE je.credit - je.debit END) AS movement
                FROM journal_entries je
                JOIN accounts a ON a.id = je.account_id
                GROUP BY 1, 2, 3
             )
             INSERT INTO account_key_daily_balances
                (day, account_key, journal_team_id, debit, credit, balance, start_balance)
             SELECT day, account_key, journal_team_id, debit, credit,
                    SUM(movement) OVER (
                        PARTITION BY account_key, journal_team_id
                        ORDER BY day ROWS UNBOUNDED PRECEDING),
                    0
             FROM movements WHERE true
             ON CONFLICT(day, account_key, journal_team_id) DO UPDATE SET
                debit = excluded.debit,
                credit = excluded.credit,
                balance = excluded.balance",
            day = book_day_sql("je.entry_time")
        );
        self.conn.execute(&sql, params![to_modifier(offset_secs), to_modifier(-offset_secs)])
    }

    /// Delete account-key rows whose day has no journal entries left.
    pub fn prune_account_key_orphans(&self, offset_secs: i32) -> Result<usize, rusqlite::Error> {
        let sql = format!(
            "DELETE FROM account_key_daily_balances
             WHERE NOT EXISTS (
                SELECT 1 FROM journal_entries je
                JOIN accounts a ON a.id = je.account_id
                WHERE a.account_key = account_key_daily_balances.account_key
                  AND je.team_id = account_key_daily_balances.journal_team_id
                  AND {day} = account_key_daily_balances.day
             )",
            day = book_day_sql("je.entry_time")
        );
        self.conn.execute(&sql, params![to_modifier(offset_secs), to_modifier(-offset_secs)])
    }

    /// Set each row's `start_balance` to the previous row's closing balance.
    pub fn recompute_account_key_start_balances(&self) -> Result<usize, rusqlite::Error> {
        self.conn.execute(
            "UPDATE account_key_daily_balances
             SET start_balance = prev.start_balance
             FROM (
                SELECT day, account_key, journal_team_id,
                       COALESCE(LAG(balance) OVER (
                           PARTITION BY account_key, journal_team_id ORDER BY day), 0) AS start_balance
                FROM account_key_daily_balances
             ) AS prev
             WHERE account_key_daily_balances.day = prev.day
               AND account_key_daily_balances.account_key = prev.account_key
               AND account_key_daily_balances.journal_team_id = prev.journal_team_id",
            [],
        )
    }

    // =========================================================================
    // Redelivery guard
    // =========================================================================

    /// Record that an entry has been folded into the daily tables.
    /// Returns `false` if it already was.
    pub fn mark_entry_aggregated(&self, entry_id: u64) -> Result<bool, rusqlite::Error> {
        let inserted = self.conn.execute(
            "INSERT INTO aggregated_entries (entry_id, applied_at) VALUES (?1, ?2)
             ON CONFLICT(entry_id) DO NOTHING",
            params![entry_id as i64, to_db_time(Utc::now())],
        )?;
        Ok(inserted > 0)
    }

    pub fn clear_aggregated_entries(&self) -> Result<usize, rusqlite::Error> {
        self.conn.execute("DELETE FROM aggregated_entries", [])
    }
}
