use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::error::{is_unique_violation, LedgerError};
use crate::util::{parse_time_column, to_db_time};

/// Fields for a new `accounts` row.
#[derive(Debug, Clone)]
pub struct NewAccount<'a> {
    pub account_key: &'a str,
    pub team_id: u64,
    pub coa: Coa,
    pub balance_type: BalanceType,
    pub name: &'a str,
    pub can_adjust: bool,
}

const ACCOUNT_COLUMNS: &str =
    "id, account_key, team_id, coa, balance_type, name, can_adjust, created";

impl LedgerDb {
    // =========================================================================
    // Accounts
    // =========================================================================

    /// Look up an account by its reserved key within a team.
    pub fn find_account_by_key(
        &self,
        key: &str,
        team_id: u64,
    ) -> Result<Option<Account>, rusqlite::Error> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_key = ?1 AND team_id = ?2"
                ),
                params![key, team_id as i64],
                Self::map_account_row,
            )
            .optional()
    }

    /// Get an account by id.
    pub fn get_account(&self, id: u64) -> Result<Option<Account>, rusqlite::Error> {
        self.conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id as i64],
                Self::map_account_row,
            )
            .optional()
    }

    /// All accounts owned by a team, ordered by key.
    pub fn get_team_accounts(&self, team_id: u64) -> Result<Vec<Account>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE team_id = ?1 ORDER BY account_key"
        ))?;
        let rows = stmt.query_map(params![team_id as i64], Self::map_account_row)?;
        rows.collect()
    }

    /// Insert an account. A second account with the same `(account_key, team_id)`
    /// fails with `DuplicateAccount`.
    pub fn insert_account(&self, account: &NewAccount<'_>) -> Result<Account, LedgerError> {
        let created = Utc::now();
        let result = self.conn.execute(
            "INSERT INTO accounts (account_key, team_id, coa, balance_type, name, can_adjust, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                account.account_key,
                account.team_id as i64,
                account.coa.as_str(),
                account.balance_type.as_str(),
                account.name,
                account.can_adjust as i32,
                to_db_time(created),
            ],
        );

        match result {
            Ok(_) => Ok(Account {
                id: self.last_id(),
                account_key: account.account_key.to_string(),
                team_id: account.team_id,
                coa: account.coa,
                balance_type: account.balance_type,
                name: account.name.to_string(),
                can_adjust: account.can_adjust,
                created,
            }),
            Err(e) if is_unique_violation(&e) => Err(LedgerError::DuplicateAccount {
                key: account.account_key.to_string(),
                team_id: account.team_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert an account unless the team already has one with that key.
    /// Returns `true` if a row was created.
    pub fn insert_account_if_missing(
        &self,
        account: &NewAccount<'_>,
    ) -> Result<bool, rusqlite::Error> {
        let inserted = self.conn.execute(
            "INSERT INTO accounts (account_key, team_id, coa, balance_type, name, can_adjust, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(account_key, team_id) DO NOTHING",
            params![
                account.account_key,
                account.team_id as i64,
                account.coa.as_str(),
                account.balance_type.as_str(),
                account.name,
                account.can_adjust as i32,
                to_db_time(Utc::now()),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Correct the category and sign convention of an existing account.
    /// Returns `true` if the account exists.
    pub fn update_account_classification(
        &self,
        id: u64,
        coa: Coa,
        balance_type: BalanceType,
    ) -> Result<bool, rusqlite::Error> {
        let rows = self.conn.execute(
            "UPDATE accounts SET coa = ?1, balance_type = ?2 WHERE id = ?3",
            params![coa.as_str(), balance_type.as_str(), id as i64],
        )?;
        Ok(rows > 0)
    }

    fn map_account_row(row: &Row<'_>) -> rusqlite::Result<Account> {
        let coa_text: String = row.get(3)?;
        let balance_text: String = row.get(4)?;
        let created_text: String = row.get(7)?;
        Ok(Account {
            id: row.get::<_, i64>(0)? as u64,
            account_key: row.get(1)?,
            team_id: row.get::<_, i64>(2)? as u64,
            coa: Coa::parse(&coa_text).ok_or_else(|| invalid_text(3, &coa_text))?,
            balance_type: BalanceType::parse(&balance_text)
                .ok_or_else(|| invalid_text(4, &balance_text))?,
            name: row.get(5)?,
            can_adjust: row.get::<_, i32>(6)? != 0,
            created: parse_time_column(7, &created_text)?,
        })
    }
}

/// Row-mapping error for an enum column holding an unknown value.
pub(crate) fn invalid_text(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value {value:?}").into(),
    )
}

#[cfg(test)]
mod tests {
    use crate::db::test_utils::test_db;
    use super::*;

    fn cash(team_id: u64) -> NewAccount<'static> {
        NewAccount {
            account_key: "cash",
            team_id,
            coa: Coa::Asset,
            balance_type: BalanceType::Debit,
            name: "Cash",
            can_adjust: true,
        }
    }

    #[test]
    fn test_insert_and_find_by_key() {
        let db = test_db();
        let created = db.insert_account(&cash(1)).expect("insert");
        let found = db
            .find_account_by_key("cash", 1)
            .expect("query")
            .expect("should exist");
        assert_eq!(found.id, created.id);
        assert_eq!(found.balance_type, BalanceType::Debit);
        assert!(found.can_adjust);
        assert!(db.find_account_by_key("cash", 2).expect("query").is_none());
    }

    #[test]
    fn test_duplicate_key_per_team_is_rejected() {
        let db = test_db();
        db.insert_account(&cash(1)).expect("first");
        let err = db.insert_account(&cash(1)).expect_err("duplicate");
        assert!(matches!(err, LedgerError::DuplicateAccount { team_id: 1, .. }));
        // Same key for another team is fine.
        db.insert_account(&cash(2)).expect("other team");
    }

    #[test]
    fn test_insert_if_missing_is_idempotent() {
        let db = test_db();
        assert!(db.insert_account_if_missing(&cash(1)).expect("first"));
        assert!(!db.insert_account_if_missing(&cash(1)).expect("second"));
        assert_eq!(db.get_team_accounts(1).expect("list").len(), 1);
    }

    #[test]
    fn test_update_classification() {
        let db = test_db();
        let account = db.insert_account(&cash(1)).expect("insert");
        assert!(db
            .update_account_classification(account.id, Coa::Liability, BalanceType::Credit)
            .expect("update"));
        let reloaded = db.get_account(account.id).expect("get").expect("exists");
        assert_eq!(reloaded.coa, Coa::Liability);
        assert_eq!(reloaded.balance_type, BalanceType::Credit);
        assert!(!db
            .update_account_classification(9999, Coa::Asset, BalanceType::Debit)
            .expect("update missing"));
    }
}
