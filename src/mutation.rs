//! Lookup and rollback of an earlier posting by its reference id.
//!
//! Like the entry builder, a mutation is a value-passing chain with a sticky
//! first error: `by_ref_id` → `check_entry` → `rollback_entry`, then inspect
//! `err()` or call `into_result()`.

use std::collections::BTreeMap;

use crate::aggregator::LabelExtra;
use crate::db::{JournalEntry, Transaction};
use crate::entry::{change_map, ChangeMap};
use crate::envelope::BookManage;
use crate::error::LedgerError;
use crate::util::{amounts_equal, is_zero_amount, round_to_precision, BALANCE_PRECISION};

/// Debit/credit sums of one account within one team's books.
#[derive(Debug, Clone, Copy, Default)]
struct AccountSums {
    debit: f64,
    credit: f64,
    posted_debit: f64,
    posted_credit: f64,
}

impl AccountSums {
    fn net(&self) -> f64 {
        round_to_precision(self.debit - self.credit, BALANCE_PRECISION)
    }

    fn posted_net(&self) -> f64 {
        round_to_precision(self.posted_debit - self.posted_credit, BALANCE_PRECISION)
    }
}

/// Split a raw `debit - credit` net into its `(debit, credit)` pair.
fn split_net(net: f64) -> (f64, f64) {
    if net >= 0.0 {
        (net, 0.0)
    } else {
        (0.0, -net)
    }
}

pub struct TransactionMutation<'m> {
    book: &'m BookManage<'m>,
    transaction: Option<Transaction>,
    entries: Option<Vec<JournalEntry>>,
    rollback_entries: Vec<JournalEntry>,
    err: Option<LedgerError>,
}

impl<'m> TransactionMutation<'m> {
    pub fn new(book: &'m BookManage<'m>) -> Self {
        Self {
            book,
            transaction: None,
            entries: None,
            rollback_entries: Vec::new(),
            err: None,
        }
    }

    /// Load the posting whose `ref_id` matches.
    ///
    /// A missing posting sets `TransactionNotFound`, which `is_not_found()`
    /// tells apart from storage failures. `lock` is honoured by the
    /// envelope's write reservation.
    pub fn by_ref_id(mut self, ref_id: impl ToString, lock: bool) -> Self {
        if self.err.is_some() {
            return self;
        }
        let ref_id = ref_id.to_string();
        if lock {
            log::debug!("TransactionMutation: loading {} for update", ref_id);
        }
        match self.book.db().find_transaction_by_ref(&ref_id) {
            Ok(Some(transaction)) => {
                self.transaction = Some(transaction);
                self.entries = None;
            }
            Ok(None) => self.err = Some(LedgerError::TransactionNotFound(ref_id)),
            Err(e) => self.err = Some(e.into()),
        }
        self
    }

    pub fn is_exist(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn data(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn err(&self) -> Option<&LedgerError> {
        self.err.as_ref()
    }

    /// Rows written by the last `rollback_entry`.
    pub fn rollback_entries(&self) -> &[JournalEntry] {
        &self.rollback_entries
    }

    /// Surface the sticky error, or hand the mutation back.
    pub fn into_result(self) -> Result<Self, LedgerError> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Reload the posting's entries, resolve their accounts, and verify
    /// that the posting as a whole still balances.
    pub fn check_entry(mut self) -> Self {
        if let Err(e) = self.check_entry_inner() {
            self.err = Some(e);
        }
        self
    }

    /// Net per-account change of the posting, including any reversals.
    pub fn change_map(&self) -> Result<ChangeMap, LedgerError> {
        let Some(transaction) = self.transaction.as_ref() else {
            return Err(LedgerError::TransactionNotLoaded);
        };
        let loaded;
        let entries = match &self.entries {
            Some(entries) => entries,
            None => {
                loaded = self.book.db().get_transaction_entries(transaction.id)?;
                &loaded
            }
        };
        let registry = self.book.registry();
        change_map(entries, |id| registry.load(self.book.db(), id))
    }

    /// Append reversal rows to the posting.
    ///
    /// Each team's books are reversed by their own builder. While the
    /// posting still has an effect, the current per-account net is inverted
    /// (the original debit is passed in `set`'s credit slot and vice versa).
    /// Once it nets to zero everywhere, a further call re-applies the original
    /// posting, so repeated calls alternate between the two states.
    pub fn rollback_entry(mut self, user_id: u64, desc: &str) -> Self {
        if self.err.is_some() {
            return self;
        }
        match self.rollback_entry_inner(user_id, desc) {
            Ok(rows) => {
                if let Some(entries) = self.entries.as_mut() {
                    entries.extend_from_slice(&rows);
                }
                self.rollback_entries = rows;
            }
            Err(e) => self.err = Some(e),
        }
        self
    }

    fn check_entry_inner(&mut self) -> Result<(), LedgerError> {
        if let Some(err) = self.err.take() {
            return Err(err);
        }
        let transaction = self
            .transaction
            .as_ref()
            .ok_or(LedgerError::TransactionNotLoaded)?;
        let db = self.book.db();
        let entries = db.get_transaction_entries(transaction.id)?;

        let mut debit = 0.0;
        let mut credit = 0.0;
        for entry in &entries {
            self.book.registry().load(db, entry.account_id)?;
            debit += entry.debit;
            credit += entry.credit;
        }
        if !amounts_equal(debit, credit) {
            return Err(LedgerError::EntryInvalid {
                debit: round_to_precision(debit, BALANCE_PRECISION),
                credit: round_to_precision(credit, BALANCE_PRECISION),
                entries,
                precision: BALANCE_PRECISION,
            });
        }
        self.entries = Some(entries);
        Ok(())
    }

    fn rollback_entry_inner(
        &mut self,
        user_id: u64,
        desc: &str,
    ) -> Result<Vec<JournalEntry>, LedgerError> {
        let transaction = self
            .transaction
            .clone()
            .ok_or(LedgerError::TransactionNotLoaded)?;
        let db = self.book.db();
        let entries = db.get_transaction_entries(transaction.id)?;

        let mut books: BTreeMap<u64, BTreeMap<u64, AccountSums>> = BTreeMap::new();
        for entry in &entries {
            let sums = books
                .entry(entry.team_id)
                .or_default()
                .entry(entry.account_id)
                .or_default();
            sums.debit += entry.debit;
            sums.credit += entry.credit;
            if !entry.rollback {
                sums.posted_debit += entry.debit;
                sums.posted_credit += entry.credit;
            }
        }

        let restoring = books
            .values()
            .flat_map(|accounts| accounts.values())
            .all(|sums| is_zero_amount(sums.net()));

        let labels = db.get_transaction_labels(transaction.id)?;
        self.book
            .record_label_extra(transaction.id, LabelExtra::from_labels(&labels), false);

        let mut written = Vec::new();
        for (team_id, accounts) in &books {
            let mut builder = self
                .book
                .new_create_entry(*team_id, user_id)
                .transaction(&transaction)
                .desc(desc)
                .mark_rollback();
            for (account_id, sums) in accounts {
                if restoring {
                    let (debit, credit) = split_net(sums.posted_net());
                    if is_zero_amount(debit) && is_zero_amount(credit) {
                        continue;
                    }
                    builder = builder.set(*account_id, credit, debit);
                } else {
                    let (debit, credit) = split_net(sums.net());
                    if is_zero_amount(debit) && is_zero_amount(credit) {
                        continue;
                    }
                    builder = builder.set(*account_id, debit, credit);
                }
            }
            if builder.err().is_none() && builder.is_empty() {
                continue;
            }
            written.extend(builder.commit()?.entries);
        }

        if written.is_empty() {
            log::info!(
                "TransactionMutation: {} has no net effect, nothing to roll back",
                transaction.ref_id
            );
        } else {
            log::info!(
                "TransactionMutation: {} {} with {} rows",
                if restoring { "re-applied" } else { "rolled back" },
                transaction.ref_id,
                written.len()
            );
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::accounts::keys;
    use crate::context::Context;
    use crate::db::accounts::NewAccount;
    use crate::db::test_utils::test_db;
    use crate::db::{BalanceType, Coa, LedgerDb};
    use super::*;

    fn seed(db: &LedgerDb) -> (u64, u64) {
        let mut ids = Vec::new();
        for team_id in [1, 2] {
            ids.push(
                db.insert_account(&NewAccount {
                    account_key: keys::CASH,
                    team_id,
                    coa: Coa::Asset,
                    balance_type: BalanceType::Debit,
                    name: "Cash",
                    can_adjust: true,
                })
                .expect("account")
                .id,
            );
        }
        (ids[0], ids[1])
    }

    fn post(book: &BookManage<'_>) {
        book.new_transaction()
            .ref_id("order#1")
            .team_id(1)
            .created_by(1)
            .create()
            .expect("header");
        book.new_create_entry(1, 1)
            .from((keys::CASH, 1), 1200.0)
            .to((keys::CASH, 2), 1200.0)
            .commit()
            .expect("commit");
    }

    fn nets(db: &LedgerDb, ref_id: &str) -> HashMap<u64, f64> {
        let tx = db
            .find_transaction_by_ref(ref_id)
            .expect("query")
            .expect("tx");
        let mut nets = HashMap::new();
        for e in db.get_transaction_entries(tx.id).expect("entries") {
            *nets.entry(e.account_id).or_insert(0.0) += e.debit - e.credit;
        }
        nets
    }

    #[test]
    fn test_missing_ref_is_not_found() {
        let db = test_db();
        let ctx = Context::new();
        let book = BookManage::new(&db, &ctx);
        let lookup = book.mutation().by_ref_id("order#404", true);
        assert!(!lookup.is_exist());
        assert!(lookup.err().is_some_and(LedgerError::is_not_found));
        assert!(lookup.into_result().is_err());
    }

    #[test]
    fn test_check_entry_on_balanced_posting() {
        let db = test_db();
        let (cash1, cash2) = seed(&db);
        let ctx = Context::new();
        let book = BookManage::new(&db, &ctx);
        post(&book);

        let lookup = book.mutation().by_ref_id("order#1", false).check_entry();
        assert!(lookup.err().is_none());
        assert_eq!(lookup.data().map(|t| t.ref_id.as_str()), Some("order#1"));
        let changes = lookup.change_map().expect("changes");
        assert_eq!(changes.get(&cash1), Some(&-1200.0));
        assert_eq!(changes.get(&cash2), Some(&1200.0));
    }

    #[test]
    fn test_rollback_nets_to_zero() {
        let db = test_db();
        let (cash1, cash2) = seed(&db);
        let ctx = Context::new();
        let book = BookManage::new(&db, &ctx);
        post(&book);

        let rolled = book
            .mutation()
            .by_ref_id("order#1", true)
            .check_entry()
            .rollback_entry(1, "cancel");
        assert!(rolled.err().is_none());
        let rows = rolled.rollback_entries();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|e| e.rollback && e.desc == "cancel"));

        let nets = nets(&db, "order#1");
        assert_eq!(nets[&cash1], 0.0);
        assert_eq!(nets[&cash2], 0.0);
        assert!(rolled.change_map().expect("changes").is_empty());
    }

    #[test]
    fn test_change_map_tracks_rollbacks_on_the_same_chain() {
        let db = test_db();
        let (cash1, cash2) = seed(&db);
        let ctx = Context::new();
        let book = BookManage::new(&db, &ctx);
        post(&book);

        let once = book
            .mutation()
            .by_ref_id("order#1", true)
            .check_entry()
            .rollback_entry(1, "cancel");
        assert!(once.change_map().expect("changes").is_empty());

        let twice = once.rollback_entry(1, "restore");
        assert!(twice.err().is_none());
        let changes = twice.change_map().expect("changes");
        assert_eq!(changes.get(&cash1), Some(&-1200.0));
        assert_eq!(changes.get(&cash2), Some(&1200.0));
    }

    #[test]
    fn test_rollback_alternates() {
        let db = test_db();
        let (cash1, cash2) = seed(&db);
        let ctx = Context::new();
        let book = BookManage::new(&db, &ctx);
        post(&book);

        for round in 1..=5 {
            let rolled = book
                .mutation()
                .by_ref_id("order#1", true)
                .rollback_entry(1, "toggle");
            assert!(rolled.err().is_none(), "round {round}");
            let nets = nets(&db, "order#1");
            if round % 2 == 1 {
                assert_eq!((nets[&cash1], nets[&cash2]), (0.0, 0.0), "round {round}");
            } else {
                assert_eq!((nets[&cash1], nets[&cash2]), (-1200.0, 1200.0), "round {round}");
            }
        }

        let tx = db
            .find_transaction_by_ref("order#1")
            .expect("query")
            .expect("tx");
        for e in db.get_transaction_entries(tx.id).expect("entries") {
            assert!(e.debit <= 1200.0 && e.credit <= 1200.0);
            assert!(e.debit == 0.0 || e.credit == 0.0);
        }
    }

    #[test]
    fn test_rollback_without_lookup() {
        let db = test_db();
        let ctx = Context::new();
        let book = BookManage::new(&db, &ctx);
        let rolled = book.mutation().rollback_entry(1, "nothing");
        assert!(matches!(rolled.err(), Some(LedgerError::TransactionNotLoaded)));
    }
}
