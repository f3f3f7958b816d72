//! Daily-balance aggregator.
//!
//! Projects committed journal entries onto the day buckets: the account
//! table, one label table per label present on the posting, and the
//! cumulative account-key table. Every write is an additive upsert, and each
//! entry id is recorded in `aggregated_entries` so a redelivered payload is
//! not counted twice.
//!
//! Rollback rows are already physical inverses of what they reverse, so
//! their debit and credit are applied as stored.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::accounts::AccountRegistry;
use crate::db::daily::{DailyBucket, DailyDelta};
use crate::db::transactions::TransactionLabels;
use crate::db::{Account, JournalEntry, LedgerDb};
use crate::error::LedgerError;
use crate::util::book_day;

/// Label dimensions of a posting, as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelExtra {
    #[serde(default)]
    pub shop_id: Option<u64>,
    #[serde(default)]
    pub cs_id: Option<u64>,
    #[serde(default)]
    pub supplier_id: Option<u64>,
    #[serde(default)]
    pub tag_ids: Vec<u64>,
}

impl LabelExtra {
    pub fn is_empty(&self) -> bool {
        self.shop_id.is_none()
            && self.cs_id.is_none()
            && self.supplier_id.is_none()
            && self.tag_ids.is_empty()
    }

    /// Label extras as stored for a posting header.
    pub fn from_labels(labels: &TransactionLabels) -> Self {
        Self {
            shop_id: labels.shop_ids.first().copied(),
            cs_id: labels.cs_ids.first().copied(),
            supplier_id: labels.supplier_ids.first().copied(),
            tag_ids: labels.tag_ids.clone(),
        }
    }

    /// Label-table buckets an entry of this posting lands in.
    pub fn buckets(&self) -> Vec<DailyBucket> {
        let mut buckets = Vec::with_capacity(3 + self.tag_ids.len());
        if let Some(id) = self.shop_id {
            buckets.push(DailyBucket::Shop(id));
        }
        if let Some(id) = self.cs_id {
            buckets.push(DailyBucket::CustomerService(id));
        }
        if let Some(id) = self.supplier_id {
            buckets.push(DailyBucket::Supplier(id));
        }
        buckets.extend(self.tag_ids.iter().map(|id| DailyBucket::CustomLabel(*id)));
        buckets
    }
}

/// Aggregator input.
///
/// Entries whose `transaction_id` has a `transaction_labels` record land in
/// that posting's label buckets. The envelope-wide `label_extra` is used only
/// when `transaction_labels` is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyUpdatePayload {
    pub entries: Vec<JournalEntry>,
    #[serde(default)]
    pub label_extra: Option<LabelExtra>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transaction_labels: BTreeMap<u64, LabelExtra>,
}

impl DailyUpdatePayload {
    fn buckets_for(&self, transaction_id: u64) -> Vec<DailyBucket> {
        let extra = if self.transaction_labels.is_empty() {
            self.label_extra.as_ref()
        } else {
            self.transaction_labels.get(&transaction_id)
        };
        extra.map(LabelExtra::buckets).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub applied: usize,
    /// Entries skipped because their id was aggregated before.
    pub duplicates: usize,
}

/// Which tables `project_entry` writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Projection {
    /// Account, label and account-key tables.
    Full,
    /// Account and label tables only; the account-key table is left to resync.
    LabelTables,
}

/// Fold one entry into the daily tables.
pub(crate) fn project_entry(
    db: &LedgerDb,
    account: &Account,
    entry: &JournalEntry,
    buckets: &[DailyBucket],
    projection: Projection,
) -> Result<(), rusqlite::Error> {
    let day = book_day(entry.entry_time);
    let delta = DailyDelta {
        day,
        account_id: entry.account_id,
        journal_team_id: entry.team_id,
        debit: entry.debit,
        credit: entry.credit,
        balance: account.balance_type.balance_delta(entry.debit, entry.credit),
    };

    db.upsert_daily_balance(DailyBucket::Account, &delta)?;
    for bucket in buckets {
        db.upsert_daily_balance(*bucket, &delta)?;
    }
    if projection == Projection::Full {
        db.apply_account_key_movement(
            day,
            &account.account_key,
            entry.team_id,
            entry.debit,
            entry.credit,
            delta.balance,
        )?;
    }
    Ok(())
}

/// Apply a payload on `db`'s current transaction.
///
/// Callers that are not already inside a transaction should use
/// [`receive_daily_update`].
pub fn apply_daily_update(
    db: &LedgerDb,
    payload: &DailyUpdatePayload,
) -> Result<ApplySummary, LedgerError> {
    let registry = AccountRegistry::new();
    let mut buckets_by_tx: HashMap<u64, Vec<DailyBucket>> = HashMap::new();

    let mut summary = ApplySummary::default();
    for entry in &payload.entries {
        if let Some(id) = entry.id {
            if !db.mark_entry_aggregated(id)? {
                log::debug!("Aggregator: entry {} already applied, skipping", id);
                summary.duplicates += 1;
                continue;
            }
        }
        let account = registry.load(db, entry.account_id)?;
        let buckets = buckets_by_tx
            .entry(entry.transaction_id)
            .or_insert_with(|| payload.buckets_for(entry.transaction_id));
        project_entry(db, &account, entry, buckets.as_slice(), Projection::Full)?;
        summary.applied += 1;
    }

    if summary.duplicates > 0 {
        log::info!(
            "Aggregator: applied {} entries, skipped {} redelivered",
            summary.applied,
            summary.duplicates
        );
    }
    Ok(summary)
}

/// Aggregator endpoint body: decode a JSON payload and apply it atomically.
pub fn receive_daily_update(db: &LedgerDb, body: &[u8]) -> Result<ApplySummary, LedgerError> {
    let payload: DailyUpdatePayload = serde_json::from_slice(body)?;
    db.with_transaction(|db| apply_daily_update(db, &payload))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use crate::accounts::keys;
    use crate::db::accounts::NewAccount;
    use crate::db::daily::DailyTable;
    use crate::db::test_utils::test_db;
    use crate::db::{BalanceType, Coa};
    use super::*;

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

    fn entry(id: u64, account_id: u64, debit: f64, credit: f64, hour: u32, rollback: bool) -> JournalEntry {
        JournalEntry {
            id: Some(id),
            transaction_id: 1,
            desc: String::new(),
            account_id,
            team_id: 1,
            created_by_id: 1,
            debit,
            credit,
            entry_time: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            rollback,
        }
    }

    #[test]
    fn test_payload_wire_shape() {
        let json = r#"{
            "entries": [{
                "id": 1, "transaction_id": 3, "desc": "", "account_id": 11, "team_id": 1,
                "debit": 10.5, "credit": 0, "entry_time": "2024-05-01T03:00:00Z", "rollback": false
            }],
            "label_extra": {"shop_id": 42, "cs_id": null, "supplier_id": null, "tag_ids": [7, 8]}
        }"#;
        let payload: DailyUpdatePayload = serde_json::from_str(json).expect("decode");
        assert_eq!(payload.entries[0].debit, 10.5);
        let extra = payload.label_extra.expect("labels");
        assert_eq!(
            extra.buckets(),
            vec![
                DailyBucket::Shop(42),
                DailyBucket::CustomLabel(7),
                DailyBucket::CustomLabel(8)
            ]
        );
    }

    #[test]
    fn test_apply_projects_every_dimension() {
        let db = test_db();
        let cash = account(&db, keys::CASH, 1, BalanceType::Debit);
        let payload = DailyUpdatePayload {
            entries: vec![entry(1, cash.id, 100.0, 0.0, 3, false), entry(2, cash.id, 0.0, 40.0, 5, false)],
            label_extra: Some(LabelExtra {
                shop_id: Some(42),
                cs_id: Some(3),
                supplier_id: None,
                tag_ids: vec![9],
            }),
            ..DailyUpdatePayload::default()
        };
        let summary = db
            .with_transaction(|db| apply_daily_update(db, &payload))
            .expect("apply");
        assert_eq!(summary.applied, 2);

        let day = book_day(payload.entries[0].entry_time);
        for bucket in [
            DailyBucket::Account,
            DailyBucket::Shop(42),
            DailyBucket::CustomerService(3),
            DailyBucket::CustomLabel(9),
        ] {
            let row = db
                .get_daily_balance(bucket, day, cash.id, 1)
                .expect("query")
                .unwrap_or_else(|| panic!("{bucket:?} row"));
            assert_eq!((row.debit, row.credit, row.balance), (100.0, 40.0, 60.0));
        }
        assert!(db
            .sum_label_balances(DailyTable::Supplier, cash.id, 1, day, day)
            .expect("supplier")
            .is_empty());

        let key_rows = db.get_account_key_balances(keys::CASH, 1).expect("key rows");
        assert_eq!(key_rows.len(), 1);
        assert_eq!(key_rows[0].balance, 60.0);
    }

    #[test]
    fn test_labels_are_taken_per_transaction() {
        let db = test_db();
        let cash = account(&db, keys::CASH, 1, BalanceType::Debit);
        let mut second = entry(2, cash.id, 30.0, 0.0, 3, false);
        second.transaction_id = 2;
        let shop = |id| LabelExtra {
            shop_id: Some(id),
            ..LabelExtra::default()
        };
        let payload = DailyUpdatePayload {
            entries: vec![entry(1, cash.id, 100.0, 0.0, 3, false), second],
            label_extra: Some(shop(43)),
            transaction_labels: BTreeMap::from([(1, shop(42)), (2, shop(43))]),
        };
        let body = serde_json::to_vec(&payload).expect("encode");
        receive_daily_update(&db, &body).expect("apply");

        let day = book_day(payload.entries[0].entry_time);
        let totals = db
            .sum_label_balances(DailyTable::Shop, cash.id, 1, day, day)
            .expect("shops");
        assert_eq!(totals, vec![(42, 100.0), (43, 30.0)]);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let db = test_db();
        let cash = account(&db, keys::CASH, 1, BalanceType::Debit);
        let payload = DailyUpdatePayload {
            entries: vec![entry(1, cash.id, 100.0, 0.0, 3, false)],
            label_extra: None,
            ..DailyUpdatePayload::default()
        };
        let body = serde_json::to_vec(&payload).expect("encode");
        let first = receive_daily_update(&db, &body).expect("first");
        let second = receive_daily_update(&db, &body).expect("second");
        assert_eq!(first, ApplySummary { applied: 1, duplicates: 0 });
        assert_eq!(second, ApplySummary { applied: 0, duplicates: 1 });

        let day = book_day(payload.entries[0].entry_time);
        let row = db
            .get_daily_balance(DailyBucket::Account, day, cash.id, 1)
            .expect("query")
            .expect("row");
        assert_eq!(row.debit, 100.0);
    }

    #[test]
    fn test_rollback_rows_applied_as_stored() {
        let db = test_db();
        let cash = account(&db, keys::CASH, 1, BalanceType::Debit);
        let payload = DailyUpdatePayload {
            entries: vec![
                entry(1, cash.id, 0.0, 1200.0, 3, false),
                entry(2, cash.id, 1200.0, 0.0, 4, true),
            ],
            label_extra: None,
            ..DailyUpdatePayload::default()
        };
        db.with_transaction(|db| apply_daily_update(db, &payload))
            .expect("apply");
        let day = book_day(payload.entries[0].entry_time);
        let row = db
            .get_daily_balance(DailyBucket::Account, day, cash.id, 1)
            .expect("query")
            .expect("row");
        assert_eq!((row.debit, row.credit, row.balance), (1200.0, 1200.0, 0.0));
    }

    #[test]
    fn test_entries_split_across_book_days() {
        let db = test_db();
        let cash = account(&db, keys::CASH, 1, BalanceType::Debit);
        // 16:00Z is 23:00 in Jakarta, 18:00Z is 01:00 the next local day.
        let payload = DailyUpdatePayload {
            entries: vec![
                entry(1, cash.id, 10.0, 0.0, 16, false),
                entry(2, cash.id, 20.0, 0.0, 18, false),
            ],
            label_extra: None,
            ..DailyUpdatePayload::default()
        };
        db.with_transaction(|db| apply_daily_update(db, &payload))
            .expect("apply");
        let series = db
            .get_daily_balances(
                DailyTable::Account,
                cash.id,
                1,
                Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
            )
            .expect("series");
        let debits: Vec<f64> = series.iter().map(|r| r.debit).collect();
        assert_eq!(debits, vec![10.0, 20.0]);

        let key_rows = db.get_account_key_balances(keys::CASH, 1).expect("key rows");
        let closing: Vec<(f64, f64)> = key_rows.iter().map(|r| (r.start_balance, r.balance)).collect();
        assert_eq!(closing, vec![(0.0, 10.0), (10.0, 30.0)]);
    }
}
