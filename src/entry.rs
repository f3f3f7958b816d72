//! Journal-entry builder.
//!
//! A builder accumulates signed contributions per account, then `commit`
//! splits, validates and persists them as one balanced batch. Every chained
//! call takes and returns the builder by value; the first failure is kept and
//! turns every later call into a no-op, so a chain can be written without
//! intermediate `?` and checked once at `commit` (or through `err`).

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, SubsecRound, Utc};

use crate::db::{Account, JournalEntry, Transaction};
use crate::envelope::BookManage;
use crate::error::LedgerError;
use crate::util::{amounts_equal, is_zero_amount, round_to_precision, BALANCE_PRECISION};

/// Net balance movement per account id, in each account's own sign
/// convention: positive grows the account, negative shrinks it.
pub type ChangeMap = BTreeMap<u64, f64>;

/// How a builder call names its account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountPayload<'k> {
    Key {
        key: &'k str,
        team_id: u64,
        lock: bool,
    },
    Id(u64),
}

impl<'k> AccountPayload<'k> {
    pub fn key(key: &'k str, team_id: u64) -> Self {
        AccountPayload::Key {
            key,
            team_id,
            lock: false,
        }
    }

    pub fn id(account_id: u64) -> Self {
        AccountPayload::Id(account_id)
    }

    /// Ask for the account row to be held until the envelope closes.
    pub fn locked(self) -> Self {
        match self {
            AccountPayload::Key { key, team_id, .. } => AccountPayload::Key {
                key,
                team_id,
                lock: true,
            },
            id => id,
        }
    }
}

impl<'k> From<(&'k str, u64)> for AccountPayload<'k> {
    fn from((key, team_id): (&'k str, u64)) -> Self {
        AccountPayload::key(key, team_id)
    }
}

impl From<&Account> for AccountPayload<'_> {
    fn from(account: &Account) -> Self {
        AccountPayload::Id(account.id)
    }
}

/// Per-call options for `from_with`, `to_with`, `rollback_with` and `transfer_with`.
#[derive(Debug, Clone, Default)]
pub struct EntryOpts {
    pub desc: Option<String>,
}

impl EntryOpts {
    pub fn desc(text: impl Into<String>) -> Self {
        Self {
            desc: Some(text.into()),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    account_id: u64,
    debit: f64,
    credit: f64,
    desc: Option<String>,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitResult {
    /// Persisted rows in insertion order, ids filled in.
    pub entries: Vec<JournalEntry>,
    pub change_map: ChangeMap,
}

/// Net per-account movement of a set of entries. Accounts whose movement
/// rounds to zero are left out.
pub fn change_map<F>(entries: &[JournalEntry], mut resolve: F) -> Result<ChangeMap, LedgerError>
where
    F: FnMut(u64) -> Result<Account, LedgerError>,
{
    let mut changes = ChangeMap::new();
    for entry in entries {
        let account = resolve(entry.account_id)?;
        *changes.entry(entry.account_id).or_insert(0.0) +=
            account.balance_type.balance_delta(entry.debit, entry.credit);
    }
    changes.retain(|_, change| {
        *change = round_to_precision(*change, BALANCE_PRECISION);
        !is_zero_amount(*change)
    });
    Ok(changes)
}

pub struct EntryBuilder<'b> {
    book: &'b BookManage<'b>,
    team_id: u64,
    created_by_id: u64,
    pending: Vec<PendingEntry>,
    positions: HashMap<u64, usize>,
    desc: Option<String>,
    entry_time: Option<DateTime<Utc>>,
    transaction: Option<Transaction>,
    rollback: bool,
    err: Option<LedgerError>,
}

impl<'b> EntryBuilder<'b> {
    pub(crate) fn new(book: &'b BookManage<'b>, team_id: u64, created_by_id: u64) -> Self {
        Self {
            book,
            team_id,
            created_by_id,
            pending: Vec::new(),
            positions: HashMap::new(),
            desc: None,
            entry_time: None,
            transaction: book.current_transaction(),
            rollback: false,
            err: None,
        }
    }

    /// Take `amount` out of an account: `-amount` in its sign convention.
    pub fn from<'k>(self, account: impl Into<AccountPayload<'k>>, amount: f64) -> Self {
        self.from_with(account, amount, EntryOpts::default())
    }

    pub fn from_with<'k>(
        self,
        account: impl Into<AccountPayload<'k>>,
        amount: f64,
        opts: EntryOpts,
    ) -> Self {
        self.post(account.into(), -amount, opts)
    }

    /// Put `amount` into an account: `+amount` in its sign convention.
    pub fn to<'k>(self, account: impl Into<AccountPayload<'k>>, amount: f64) -> Self {
        self.to_with(account, amount, EntryOpts::default())
    }

    pub fn to_with<'k>(
        self,
        account: impl Into<AccountPayload<'k>>,
        amount: f64,
        opts: EntryOpts,
    ) -> Self {
        self.post(account.into(), amount, opts)
    }

    /// Add a literal debit/credit pair. Note the argument order: credit first.
    pub fn set(mut self, account_id: u64, credit: f64, debit: f64) -> Self {
        if self.err.is_some() {
            return self;
        }
        if credit < 0.0 || debit < 0.0 || (is_zero_amount(credit) && is_zero_amount(debit)) {
            self.err = Some(LedgerError::ZeroAmount);
            return self;
        }
        match self.resolve(AccountPayload::Id(account_id)) {
            Ok(account) => self.accumulate(account.id, debit, credit, None),
            Err(e) => self.err = Some(e),
        }
        self
    }

    /// Undo a previously posted change map: growth is taken back out with
    /// `from`, shrinkage is put back with `to`.
    pub fn rollback(self, change_map: &ChangeMap) -> Self {
        self.rollback_with(change_map, EntryOpts::default())
    }

    pub fn rollback_with(mut self, change_map: &ChangeMap, opts: EntryOpts) -> Self {
        for (&account_id, &change) in change_map {
            if is_zero_amount(change) {
                continue;
            }
            self = if change > 0.0 {
                self.from_with(AccountPayload::Id(account_id), change, opts.clone())
            } else {
                self.to_with(AccountPayload::Id(account_id), -change, opts.clone())
            };
        }
        self
    }

    /// Move `amount` from one account to another.
    pub fn transfer<'k>(
        self,
        from: impl Into<AccountPayload<'k>>,
        to: impl Into<AccountPayload<'k>>,
        amount: f64,
    ) -> Self {
        self.transfer_with(from, to, amount, EntryOpts::default())
    }

    pub fn transfer_with<'k>(
        mut self,
        from: impl Into<AccountPayload<'k>>,
        to: impl Into<AccountPayload<'k>>,
        amount: f64,
        opts: EntryOpts,
    ) -> Self {
        if self.err.is_some() {
            return self;
        }
        let (from, to) = match (self.resolve(from.into()), self.resolve(to.into())) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(e), _) | (_, Err(e)) => {
                self.err = Some(e);
                return self;
            }
        };
        if from.id == to.id {
            self.err = Some(LedgerError::SameAccountTransfer);
            return self;
        }
        self.from_with(&from, amount, opts.clone())
            .to_with(&to, amount, opts)
    }

    /// Description for every entry that has no per-call description.
    pub fn desc(mut self, text: impl Into<String>) -> Self {
        self.desc = Some(text.into());
        self
    }

    pub fn entry_time(mut self, at: DateTime<Utc>) -> Self {
        self.entry_time = Some(at);
        self
    }

    /// Posting header the entries belong to. Defaults to the envelope's most
    /// recently created header.
    pub fn transaction(mut self, transaction: &Transaction) -> Self {
        self.transaction = Some(transaction.clone());
        self
    }

    /// Mark every row of this batch as a reversal.
    pub(crate) fn mark_rollback(mut self) -> Self {
        self.rollback = true;
        self
    }

    /// The first error observed, if any.
    pub fn err(&self) -> Option<&LedgerError> {
        self.err.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Validate and persist the pending entries.
    ///
    /// An account whose debit and credit cancel exactly writes nothing; one
    /// with both sides non-zero is written as a debit row followed by a
    /// credit row. Totals are compared after rounding to
    /// `BALANCE_PRECISION` decimals.
    pub fn commit(self) -> Result<CommitResult, LedgerError> {
        if let Some(err) = self.err {
            return Err(err);
        }
        if self.pending.is_empty() {
            return Err(LedgerError::EmptyEntry);
        }
        let transaction = self
            .transaction
            .as_ref()
            .ok_or(LedgerError::TransactionNotLoaded)?;
        self.book.ctx().check()?;

        let entry_time = self.entry_time.unwrap_or_else(Utc::now).trunc_subsecs(6);
        let mut total_debit = 0.0;
        let mut total_credit = 0.0;
        let mut rows = Vec::with_capacity(self.pending.len() * 2);

        for pending in &self.pending {
            total_debit += pending.debit;
            total_credit += pending.credit;

            let has_debit = !is_zero_amount(pending.debit);
            let has_credit = !is_zero_amount(pending.credit);
            if !has_debit && !has_credit {
                continue;
            }
            if has_debit && has_credit && amounts_equal(pending.debit, pending.credit) {
                log::debug!(
                    "EntryBuilder: account {} cancels out ({}), nothing written",
                    pending.account_id,
                    pending.debit
                );
                continue;
            }

            let row = JournalEntry {
                id: None,
                transaction_id: transaction.id,
                desc: pending
                    .desc
                    .clone()
                    .or_else(|| self.desc.clone())
                    .unwrap_or_else(|| transaction.desc.clone()),
                account_id: pending.account_id,
                team_id: self.team_id,
                created_by_id: self.created_by_id,
                debit: 0.0,
                credit: 0.0,
                entry_time,
                rollback: self.rollback,
            };
            if has_debit {
                rows.push(JournalEntry {
                    debit: round_to_precision(pending.debit, BALANCE_PRECISION),
                    ..row.clone()
                });
            }
            if has_credit {
                rows.push(JournalEntry {
                    credit: round_to_precision(pending.credit, BALANCE_PRECISION),
                    ..row
                });
            }
        }

        if !amounts_equal(total_debit, total_credit) {
            return Err(LedgerError::EntryInvalid {
                debit: round_to_precision(total_debit, BALANCE_PRECISION),
                credit: round_to_precision(total_credit, BALANCE_PRECISION),
                entries: rows,
                precision: BALANCE_PRECISION,
            });
        }

        self.book.db().insert_journal_entries(&mut rows)?;
        let changes = change_map(&rows, |id| self.book.registry().load(self.book.db(), id))?;
        self.book.after_commit(&rows);

        log::debug!(
            "EntryBuilder: committed {} rows for transaction {} (team {})",
            rows.len(),
            transaction.ref_id,
            self.team_id
        );
        Ok(CommitResult {
            entries: rows,
            change_map: changes,
        })
    }

    fn post(mut self, account: AccountPayload<'_>, signed_amount: f64, opts: EntryOpts) -> Self {
        if self.err.is_some() {
            return self;
        }
        if is_zero_amount(signed_amount) {
            self.err = Some(LedgerError::ZeroAmount);
            return self;
        }
        match self.resolve(account) {
            Ok(account) => {
                let (debit, credit) = account.balance_type.split_amount(signed_amount);
                self.accumulate(account.id, debit, credit, opts.desc);
            }
            Err(e) => self.err = Some(e),
        }
        self
    }

    fn resolve(&self, account: AccountPayload<'_>) -> Result<Account, LedgerError> {
        let registry = self.book.registry();
        match account {
            AccountPayload::Key { key, team_id, lock } => {
                registry.resolve(self.book.db(), key, team_id, lock)
            }
            AccountPayload::Id(id) => registry.load(self.book.db(), id),
        }
    }

    fn accumulate(&mut self, account_id: u64, debit: f64, credit: f64, desc: Option<String>) {
        match self.positions.get(&account_id) {
            Some(&index) => {
                let pending = &mut self.pending[index];
                pending.debit += debit;
                pending.credit += credit;
                if desc.is_some() {
                    pending.desc = desc;
                }
            }
            None => {
                self.positions.insert(account_id, self.pending.len());
                self.pending.push(PendingEntry {
                    account_id,
                    debit,
                    credit,
                    desc,
                });
            }
        }
    }
}
