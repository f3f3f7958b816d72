//! Ledger schema versions.
//!
//! Each step is an embedded SQL file applied in its own transaction and
//! recorded in `schema_version`. Table and index names from v1 are what
//! downstream readers query by, so later steps only add.
//!
//! Before upgrading a file that already holds a ledger, a snapshot of it is
//! written next to it as `<file>.v<current>.bak`.

use chrono::Utc;
use rusqlite::backup::Backup;
use rusqlite::Connection;

use crate::db::MigrationError;
use crate::util::to_db_time;

/// `(version, sql)` in apply order.
const STEPS: &[(i32, &str)] = &[(1, include_str!("migrations/001_baseline.sql"))];

fn latest_known() -> i32 {
    STEPS.last().map(|(version, _)| *version).unwrap_or(0)
}

fn schema_version(conn: &Connection) -> Result<i32, rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// File backing the main schema, `None` for in-memory and temp databases.
fn main_file(conn: &Connection) -> Result<Option<String>, rusqlite::Error> {
    let file: String = conn.query_row(
        "SELECT file FROM pragma_database_list WHERE name = 'main'",
        [],
        |row| row.get(0),
    )?;
    Ok(Some(file).filter(|f| !f.is_empty()))
}

fn snapshot(conn: &Connection, from_version: i32) -> Result<(), MigrationError> {
    let Some(file) = main_file(conn)? else {
        return Ok(());
    };
    let path = format!("{}.v{}.bak", file, from_version);
    let copy = |path: &str| -> Result<(), rusqlite::Error> {
        let mut target = Connection::open(path)?;
        Backup::new(conn, &mut target)?.step(-1)?;
        Ok(())
    };
    copy(&path).map_err(|source| MigrationError::Snapshot {
        path: path.clone(),
        source,
    })?;
    log::info!("Migrations: snapshot of v{} written to {}", from_version, path);
    Ok(())
}

/// Bring the schema up to the latest known version.
///
/// Returns how many steps ran. A ledger written by a newer build is refused.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    let current = schema_version(conn)?;
    let known = latest_known();
    if current > known {
        return Err(MigrationError::NewerSchema {
            found: current,
            known,
        });
    }

    let pending: Vec<(i32, &str)> = STEPS
        .iter()
        .copied()
        .filter(|(version, _)| *version > current)
        .collect();
    if pending.is_empty() {
        return Ok(0);
    }
    if current > 0 {
        snapshot(conn, current)?;
    }

    for (version, sql) in &pending {
        let step = || -> Result<(), rusqlite::Error> {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, to_db_time(Utc::now())],
            )?;
            tx.commit()
        };
        step().map_err(|source| MigrationError::Step {
            version: *version,
            source,
        })?;
        log::info!("Migrations: ledger schema now at v{}", version);
    }
    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_count(conn: &Connection, name: &str) -> i32 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .expect("query")
    }

    #[test]
    fn test_empty_ledger_gets_every_step_once() {
        let conn = Connection::open_in_memory().expect("open");
        assert_eq!(run_migrations(&conn).expect("migrate"), STEPS.len());
        assert_eq!(run_migrations(&conn).expect("again"), 0);
        assert_eq!(schema_version(&conn).expect("version"), latest_known());

        let rows: i32 = conn
            .query_row("SELECT COUNT(*) FROM journal_entries", [], |row| row.get(0))
            .expect("journal_entries");
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_ledger_from_newer_build_is_refused() {
        let conn = Connection::open_in_memory().expect("open");
        run_migrations(&conn).expect("migrate");
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, 'later')",
            [latest_known() + 1],
        )
        .expect("bump");
        match run_migrations(&conn) {
            Err(MigrationError::NewerSchema { found, known }) => {
                assert_eq!((found, known), (latest_known() + 1, latest_known()));
            }
            other => panic!("expected NewerSchema, got {other:?}"),
        }
    }

    #[test]
    fn test_lookup_indexes_exist() {
        let conn = Connection::open_in_memory().expect("open");
        run_migrations(&conn).expect("migrate");
        for index in [
            "idx_accounts_key_team",
            "idx_transactions_ref_id",
            "idx_type_labels_key_label",
            "idx_accounting_tags_name",
        ] {
            assert_eq!(index_count(&conn, index), 1, "missing index {index}");
        }
    }

    #[test]
    fn test_in_memory_ledger_has_no_snapshot_file() {
        let conn = Connection::open_in_memory().expect("open");
        assert_eq!(main_file(&conn).expect("file"), None);
    }
}
