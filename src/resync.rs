//! Off-line rebuilds of the daily aggregates.
//!
//! `resync_account_key_balances` recomputes the cumulative account-key table
//! from the journal; `rebuild_daily_balances` truncates and replays the five
//! label-keyed tables. Both hold an exclusive transaction for their whole
//! run, report progress through a callback, and are restricted to superusers.

use std::collections::HashMap;

use chrono::{Offset, TimeZone, Utc};
use serde::Serialize;

use crate::accounts::AccountRegistry;
use crate::aggregator::{project_entry, LabelExtra, Projection};
use crate::db::daily::{DailyBucket, DailyTable};
use crate::db::{LedgerDb, TxBehavior};
use crate::error::LedgerError;
use crate::util::BOOK_TZ;

/// Journal entries read per chunk during a daily rebuild.
const REBUILD_CHUNK: usize = 500;

/// Who is asking for a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: u64,
    pub superuser: bool,
}

impl Actor {
    fn authorize(&self) -> Result<(), LedgerError> {
        if self.superuser {
            Ok(())
        } else {
            log::warn!("Resync: user {} is not a superuser", self.user_id);
            Err(LedgerError::Forbidden(format!(
                "user {} may not rebuild balances",
                self.user_id
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResyncSummary {
    pub rows_written: usize,
    pub rows_pruned: usize,
    pub rows_linked: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildSummary {
    pub entries: usize,
    pub transactions: usize,
    pub rows_cleared: usize,
}

/// UTC offset of the book timezone in seconds. Jakarta has no DST.
fn book_offset_secs() -> i32 {
    BOOK_TZ
        .offset_from_utc_datetime(&Utc::now().naive_utc())
        .fix()
        .local_minus_utc()
}

/// Rebuild `account_key_daily_balances` from raw journal entries.
pub fn resync_account_key_balances(
    db: &LedgerDb,
    actor: &Actor,
    progress: &mut dyn FnMut(&str),
) -> Result<ResyncSummary, LedgerError> {
    actor.authorize()?;
    let offset = book_offset_secs();

    progress("locking ledger");
    let guard = db.begin(TxBehavior::Exclusive)?;

    progress("recomputing account-key rows");
    let rows_written = db.resync_account_key_rows(offset)?;
    progress(&format!("{} account-key rows written", rows_written));

    let rows_pruned = db.prune_account_key_orphans(offset)?;
    if rows_pruned > 0 {
        progress(&format!("{} orphaned rows removed", rows_pruned));
    }

    progress("linking start balances");
    let rows_linked = db.recompute_account_key_start_balances()?;

    guard.commit()?;
    let summary = ResyncSummary {
        rows_written,
        rows_pruned,
        rows_linked,
    };
    log::info!(
        "Resync: account-key balances rebuilt by user {} ({} rows, {} pruned)",
        actor.user_id,
        rows_written,
        rows_pruned
    );
    progress("done");
    Ok(summary)
}

/// Truncate and replay the account and label daily tables from the journal.
///
/// The redelivery guard is reset and re-marked for every replayed entry, so
/// a payload still sitting in the outbox is skipped when it is delivered.
pub fn rebuild_daily_balances(
    db: &LedgerDb,
    actor: &Actor,
    progress: &mut dyn FnMut(&str),
) -> Result<RebuildSummary, LedgerError> {
    actor.authorize()?;

    progress("locking ledger");
    let guard = db.begin(TxBehavior::Exclusive)?;

    let mut summary = RebuildSummary::default();
    for table in DailyTable::ALL {
        summary.rows_cleared += db.clear_daily_table(table)?;
    }
    db.clear_aggregated_entries()?;
    progress(&format!("{} daily rows cleared", summary.rows_cleared));

    let registry = AccountRegistry::new();
    let mut buckets_by_tx: HashMap<u64, Vec<DailyBucket>> = HashMap::new();
    let mut after_id = 0;
    loop {
        let chunk = db.get_entries_after(after_id, REBUILD_CHUNK)?;
        let Some(last) = chunk.last() else {
            break;
        };
        after_id = last.id.unwrap_or(after_id);

        for entry in &chunk {
            if !buckets_by_tx.contains_key(&entry.transaction_id) {
                let labels = db.get_transaction_labels(entry.transaction_id)?;
                buckets_by_tx.insert(
                    entry.transaction_id,
                    LabelExtra::from_labels(&labels).buckets(),
                );
            }
            let buckets = buckets_by_tx
                .get(&entry.transaction_id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let account = registry.load(db, entry.account_id)?;
            project_entry(db, &account, entry, buckets, Projection::LabelTables)?;
            if let Some(id) = entry.id {
                db.mark_entry_aggregated(id)?;
            }
        }
        summary.entries += chunk.len();
        progress(&format!("{} entries replayed", summary.entries));
    }
    summary.transactions = buckets_by_tx.len();

    guard.commit()?;
    log::info!(
        "Resync: daily tables rebuilt by user {} ({} entries across {} postings)",
        actor.user_id,
        summary.entries,
        summary.transactions
    );
    progress("done");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::accounts::keys;
    use crate::db::accounts::NewAccount;
    use crate::db::test_utils::test_db;
    use crate::db::{Account, BalanceType, Coa, JournalEntry};
    use crate::util::book_day;

    const ROOT: Actor = Actor {
        user_id: 1,
        superuser: true,
    };

    fn account(db: &LedgerDb, key: &'static str, team_id: u64, balance_type: BalanceType) -> Account {
        db.insert_account(&NewAccount {
            account_key: key,
            team_id,
            coa: Coa::Asset,
            balance_type,
            name: key,
            can_adjust: false,
        })
        .expect("account")
    }

    /// Post raw journal rows under a fresh header, bypassing the aggregator.
    fn post(db: &LedgerDb, ref_id: &str, rows: &[(u64, f64, f64, u32)]) -> u64 {
        let tx = db.insert_transaction(ref_id, 1, 1, "", Utc::now()).expect("header");
        let mut entries: Vec<JournalEntry> = rows
            .iter()
            .map(|(account_id, debit, credit, day)| JournalEntry {
                id: None,
                transaction_id: tx.id,
                desc: String::new(),
                account_id: *account_id,
                team_id: 1,
                created_by_id: 1,
                debit: *debit,
                credit: *credit,
                entry_time: Utc.with_ymd_and_hms(2024, 5, *day, 3, 0, 0).unwrap(),
                rollback: false,
            })
            .collect();
        db.insert_journal_entries(&mut entries).expect("entries");
        tx.id
    }

    #[test]
    fn test_non_superuser_is_forbidden() {
        let db = test_db();
        let actor = Actor {
            user_id: 9,
            superuser: false,
        };
        let result = resync_account_key_balances(&db, &actor, &mut |_| {});
        assert!(matches!(result, Err(LedgerError::Forbidden(_))));
        let result = rebuild_daily_balances(&db, &actor, &mut |_| {});
        assert!(matches!(result, Err(LedgerError::Forbidden(_))));
    }

    #[test]
    fn test_resync_builds_cumulative_rows() {
        let db = test_db();
        let cash = account(&db, keys::CASH, 1, BalanceType::Debit);
        let payable = account(&db, keys::PAYABLE, 1, BalanceType::Credit);
        post(&db, "test#1", &[(cash.id, 100.0, 0.0, 1), (payable.id, 0.0, 100.0, 1)]);
        post(&db, "test#2", &[(cash.id, 0.0, 30.0, 3), (payable.id, 30.0, 0.0, 3)]);

        let mut messages = Vec::new();
        let summary = resync_account_key_balances(&db, &ROOT, &mut |m| messages.push(m.to_string()))
            .expect("resync");
        assert_eq!(summary.rows_written, 4);
        assert_eq!(messages.last().map(String::as_str), Some("done"));

        let rows = db.get_account_key_balances(keys::CASH, 1).expect("cash rows");
        let shape: Vec<(f64, f64, f64, f64)> = rows
            .iter()
            .map(|r| (r.debit, r.credit, r.start_balance, r.balance))
            .collect();
        assert_eq!(shape, vec![(100.0, 0.0, 0.0, 100.0), (0.0, 30.0, 100.0, 70.0)]);
        assert_eq!(
            rows[0].day,
            book_day(Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap())
        );

        let rows = db.get_account_key_balances(keys::PAYABLE, 1).expect("payable rows");
        assert_eq!(rows[1].balance, 70.0);
    }

    #[test]
    fn test_resync_overwrites_drift_and_prunes_orphans() {
        let db = test_db();
        let cash = account(&db, keys::CASH, 1, BalanceType::Debit);
        post(&db, "test#1", &[(cash.id, 100.0, 0.0, 1)]);

        // Drift on the real day plus a row with no journal behind it.
        db.apply_account_key_movement(
            book_day(Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap()),
            keys::CASH,
            1,
            999.0,
            0.0,
            999.0,
        )
        .expect("drift");
        db.apply_account_key_movement(
            book_day(Utc.with_ymd_and_hms(2024, 5, 9, 3, 0, 0).unwrap()),
            keys::CASH,
            1,
            5.0,
            0.0,
            5.0,
        )
        .expect("orphan");

        let summary = resync_account_key_balances(&db, &ROOT, &mut |_| {}).expect("resync");
        assert_eq!(summary.rows_pruned, 1);
        let rows = db.get_account_key_balances(keys::CASH, 1).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].debit, rows[0].balance, rows[0].start_balance), (100.0, 100.0, 0.0));
    }

    #[test]
    fn test_rebuild_replays_label_tables() {
        let db = test_db();
        let cash = account(&db, keys::CASH, 1, BalanceType::Debit);
        let tx = post(&db, "test#1", &[(cash.id, 100.0, 0.0, 1)]);
        db.attach_label(crate::db::transactions::LabelTable::Shop, tx, 42)
            .expect("shop");

        // Stale row that the rebuild must discard.
        db.upsert_daily_balance(
            DailyBucket::Account,
            &crate::db::daily::DailyDelta {
                day: book_day(Utc.with_ymd_and_hms(2024, 5, 7, 3, 0, 0).unwrap()),
                account_id: cash.id,
                journal_team_id: 1,
                debit: 1.0,
                credit: 0.0,
                balance: 1.0,
            },
        )
        .expect("stale");

        let summary = rebuild_daily_balances(&db, &ROOT, &mut |_| {}).expect("rebuild");
        assert_eq!(summary.entries, 1);
        assert_eq!(summary.transactions, 1);
        assert_eq!(summary.rows_cleared, 1);

        let day = book_day(Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap());
        for bucket in [DailyBucket::Account, DailyBucket::Shop(42)] {
            let row = db
                .get_daily_balance(bucket, day, cash.id, 1)
                .expect("query")
                .unwrap_or_else(|| panic!("{bucket:?} row"));
            assert_eq!(row.balance, 100.0);
        }
        // Replayed entries are marked, so redelivery is a no-op.
        let first_id = db.get_transaction_entries(tx).expect("entries")[0].id.expect("id");
        assert!(!db.mark_entry_aggregated(first_id).expect("guard"));
    }
}
