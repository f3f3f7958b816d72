//! Transaction envelope.
//!
//! An envelope is one SQLite write transaction around a caller's handler.
//! Inside it the handler gets a [`BookManage`] to create posting headers,
//! build journal entries and look up earlier postings. On close the envelope
//! checks that something was posted, runs the before-commit handlers, commits,
//! then runs the after-commit handlers with the daily-update payload.
//!
//! Exit paths:
//! - handler returns `SkipTransaction`: rollback, no dispatch, `Ok(Skipped)`
//! - handler returns any other error, or panics: rollback
//! - before-commit handler fails: rollback
//! - after-commit handler fails: the posting stays committed, the error is returned

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SubsecRound, Utc};

use crate::accounts::AccountRegistry;
use crate::aggregator::{DailyUpdatePayload, LabelExtra};
use crate::context::Context;
use crate::db::transactions::LabelTable;
use crate::db::{JournalEntry, LedgerDb, Transaction, TxBehavior, TxGuard};
use crate::dispatch::{DispatchContext, HandlerRegistry, TraceContext};
use crate::entry::EntryBuilder;
use crate::error::LedgerError;
use crate::labels::normalize_tag_name;
use crate::mutation::TransactionMutation;
use crate::refid::RefId;

/// Per-envelope bookkeeping state handed to the caller's handler.
pub struct BookManage<'a> {
    db: &'a LedgerDb,
    ctx: &'a Context,
    registry: AccountRegistry,
    label_extra: RefCell<Option<LabelExtra>>,
    transaction_labels: RefCell<BTreeMap<u64, LabelExtra>>,
    entries: RefCell<Vec<JournalEntry>>,
    current: RefCell<Option<Transaction>>,
}

impl<'a> BookManage<'a> {
    pub(crate) fn new(db: &'a LedgerDb, ctx: &'a Context) -> Self {
        Self {
            db,
            ctx,
            registry: AccountRegistry::new(),
            label_extra: RefCell::new(None),
            transaction_labels: RefCell::new(BTreeMap::new()),
            entries: RefCell::new(Vec::new()),
            current: RefCell::new(None),
        }
    }

    /// Database handle of the open transaction.
    pub fn db(&self) -> &'a LedgerDb {
        self.db
    }

    pub fn ctx(&self) -> &'a Context {
        self.ctx
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    /// Start a posting header.
    pub fn new_transaction(&self) -> TransactionCreator<'_> {
        TransactionCreator::new(self)
    }

    /// Start a journal-entry builder booked by `team_id`.
    pub fn new_create_entry(&self, team_id: u64, created_by_id: u64) -> EntryBuilder<'_> {
        EntryBuilder::new(self, team_id, created_by_id)
    }

    /// Start a lookup of an earlier posting.
    pub fn mutation(&self) -> TransactionMutation<'_> {
        TransactionMutation::new(self)
    }

    /// Labels collected from the posting headers created so far.
    pub fn label_extra(&self) -> Option<LabelExtra> {
        self.label_extra.borrow().clone()
    }

    /// Every entry committed in this envelope, in commit order.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.borrow().clone()
    }

    /// The payload the aggregator consumes for this envelope.
    pub fn daily_update_data(&self) -> DailyUpdatePayload {
        DailyUpdatePayload {
            entries: self.entries(),
            label_extra: self.label_extra(),
            transaction_labels: self.transaction_labels.borrow().clone(),
        }
    }

    /// Most recently created or loaded posting header.
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.current.borrow().clone()
    }

    pub(crate) fn after_commit(&self, rows: &[JournalEntry]) {
        self.entries.borrow_mut().extend_from_slice(rows);
    }

    pub(crate) fn set_current(&self, transaction: &Transaction) {
        *self.current.borrow_mut() = Some(transaction.clone());
    }

    /// Record the labels of posting `transaction_id`. Its entries are
    /// aggregated under these labels only. The envelope-wide set adopts
    /// `extra` unless a non-empty set is already held and `replace` is false.
    pub(crate) fn record_label_extra(&self, transaction_id: u64, extra: LabelExtra, replace: bool) {
        if extra.is_empty() {
            return;
        }
        self.transaction_labels
            .borrow_mut()
            .insert(transaction_id, extra.clone());
        let mut slot = self.label_extra.borrow_mut();
        if replace || slot.is_none() {
            *slot = Some(extra);
        }
    }
}

/// Builder for a posting header and its label extras.
pub struct TransactionCreator<'m> {
    book: &'m BookManage<'m>,
    ref_id: String,
    team_id: u64,
    created_by_id: u64,
    desc: String,
    shop_id: Option<u64>,
    cs_id: Option<u64>,
    supplier_id: Option<u64>,
    tags: Vec<String>,
    type_labels: Vec<(String, String)>,
}

impl<'m> TransactionCreator<'m> {
    fn new(book: &'m BookManage<'m>) -> Self {
        Self {
            book,
            ref_id: String::new(),
            team_id: 0,
            created_by_id: 0,
            desc: String::new(),
            shop_id: None,
            cs_id: None,
            supplier_id: None,
            tags: Vec::new(),
            type_labels: Vec::new(),
        }
    }

    /// External reference; anything that displays as `<type>#<id>`.
    pub fn ref_id(mut self, ref_id: impl ToString) -> Self {
        self.ref_id = ref_id.to_string();
        self
    }

    pub fn team_id(mut self, team_id: u64) -> Self {
        self.team_id = team_id;
        self
    }

    pub fn created_by(mut self, user_id: u64) -> Self {
        self.created_by_id = user_id;
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    /// A posting belongs to at most one shop; a later call replaces the earlier id.
    pub fn add_shop_id(mut self, shop_id: u64) -> Self {
        self.shop_id = Some(shop_id);
        self
    }

    pub fn add_customer_service_id(mut self, cs_id: u64) -> Self {
        self.cs_id = Some(cs_id);
        self
    }

    pub fn add_supplier_id(mut self, supplier_id: u64) -> Self {
        self.supplier_id = Some(supplier_id);
        self
    }

    /// Free-form tags. Names are normalised and created on first use.
    pub fn add_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for tag in tags {
            let name = normalize_tag_name(tag.as_ref());
            if !name.is_empty() && !self.tags.contains(&name) {
                self.tags.push(name);
            }
        }
        self
    }

    pub fn add_type_label(mut self, key: impl Into<String>, label: impl Into<String>) -> Self {
        self.type_labels.push((key.into(), label.into()));
        self
    }

    /// Persist the header and attach its labels.
    ///
    /// The reference must have the `<reftype>#<key>` shape. Fails with
    /// `DuplicateRefId` when the reference was posted before.
    pub fn create(self) -> Result<Transaction, LedgerError> {
        let parsed: RefId = self.ref_id.parse()?;
        if !parsed.ref_type.is_reserved() {
            log::debug!(
                "TransactionCreator: unreserved ref type '{}'",
                parsed.ref_type.as_str()
            );
        }
        self.book.ctx().check()?;
        let db = self.book.db();

        let created = Utc::now().trunc_subsecs(6);
        let transaction = db.insert_transaction(
            &self.ref_id,
            self.team_id,
            self.created_by_id,
            &self.desc,
            created,
        )?;

        let mut extra = LabelExtra {
            shop_id: self.shop_id,
            cs_id: self.cs_id,
            supplier_id: self.supplier_id,
            tag_ids: Vec::with_capacity(self.tags.len()),
        };
        for (table, id) in [
            (LabelTable::Shop, self.shop_id),
            (LabelTable::CustomerService, self.cs_id),
            (LabelTable::Supplier, self.supplier_id),
        ] {
            if let Some(id) = id {
                db.attach_label(table, transaction.id, id)?;
            }
        }
        for name in &self.tags {
            let tag = db.ensure_tag(name)?;
            db.attach_label(LabelTable::Tag, transaction.id, tag.id)?;
            extra.tag_ids.push(tag.id);
        }
        for (key, label) in &self.type_labels {
            let type_label = db.ensure_type_label(key, label)?;
            db.attach_label(LabelTable::TypeLabel, transaction.id, type_label.id)?;
        }

        self.book.record_label_extra(transaction.id, extra, true);
        self.book.set_current(&transaction);
        log::debug!(
            "Envelope: created transaction {} ({}) for team {}",
            transaction.id,
            transaction.ref_id,
            transaction.team_id
        );
        Ok(transaction)
    }
}

/// How an envelope closed.
#[derive(Debug, Clone, PartialEq)]
pub enum Committed {
    /// The handler reported the work as already done.
    Skipped,
    /// Entries were posted; carries the payload handed to the dispatch handlers.
    Posted(DailyUpdatePayload),
}

impl Committed {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Committed::Skipped)
    }

    pub fn payload(&self) -> Option<&DailyUpdatePayload> {
        match self {
            Committed::Skipped => None,
            Committed::Posted(payload) => Some(payload),
        }
    }
}

/// Opens envelopes against one database with a fixed handler registry.
pub struct Envelope<'a> {
    db: &'a LedgerDb,
    handlers: Arc<HandlerRegistry>,
}

impl<'a> Envelope<'a> {
    pub fn new(db: &'a LedgerDb, handlers: Arc<HandlerRegistry>) -> Self {
        Self { db, handlers }
    }

    /// Run `handler` inside one write transaction.
    pub fn open<F>(&self, ctx: &Context, handler: F) -> Result<Committed, LedgerError>
    where
        F: FnOnce(&BookManage<'_>) -> Result<(), LedgerError>,
    {
        ctx.check()?;
        let guard = self.db.begin(TxBehavior::Immediate)?;
        let book = BookManage::new(self.db, ctx);

        match handler(&book) {
            Ok(()) => {}
            Err(e) if e.is_skip() => {
                guard.rollback()?;
                log::info!("Envelope: handler skipped, nothing posted");
                return Ok(Committed::Skipped);
            }
            Err(e) => return Err(abort(guard, e)),
        }

        let entries = book.entries();
        if entries.is_empty() {
            return Err(abort(guard, LedgerError::EntriesEmpty));
        }
        if let Some(entry) = entries.iter().find(|e| e.id.is_none()) {
            let err = LedgerError::EntryUnpersisted {
                account_id: entry.account_id,
            };
            return Err(abort(guard, err));
        }

        let payload = book.daily_update_data();
        let trace = TraceContext::new();
        let dispatch_ctx = DispatchContext {
            ctx,
            db: self.db,
            trace: &trace,
        };

        for handler in self.handlers.before_commit() {
            if let Err(e) = ctx.check() {
                return Err(abort(guard, e));
            }
            if let Err(e) = handler.dispatch(&dispatch_ctx, &payload) {
                log::warn!("Envelope: handler '{}' failed before commit: {}", handler.name(), e);
                return Err(abort(guard, e.into()));
            }
        }

        if let Err(e) = ctx.check() {
            return Err(abort(guard, e));
        }
        guard.commit()?;
        log::info!(
            "Envelope: committed {} entries (trace {})",
            payload.entries.len(),
            trace.trace_id
        );

        let mut first_err = None;
        for handler in self.handlers.after_commit() {
            if let Err(e) = handler.dispatch(&dispatch_ctx, &payload) {
                log::warn!(
                    "Envelope: handler '{}' failed after commit, posting kept: {}",
                    handler.name(),
                    e
                );
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(Committed::Posted(payload)),
        }
    }
}

/// Shorthand for `Envelope::new(db, handlers).open(ctx, handler)`.
pub fn open<F>(
    ctx: &Context,
    db: &LedgerDb,
    handlers: &Arc<HandlerRegistry>,
    handler: F,
) -> Result<Committed, LedgerError>
where
    F: FnOnce(&BookManage<'_>) -> Result<(), LedgerError>,
{
    Envelope::new(db, Arc::clone(handlers)).open(ctx, handler)
}

fn abort(guard: TxGuard<'_>, err: LedgerError) -> LedgerError {
    if let Err(e) = guard.rollback() {
        log::warn!("Envelope: rollback failed after '{}': {}", err, e);
    }
    err
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::accounts::keys;
    use crate::db::accounts::NewAccount;
    use crate::db::daily::DailyBucket;
    use crate::db::test_utils::test_db;
    use crate::db::{BalanceType, Coa};
    use crate::dispatch::{DailyUpdateHandler, HandlerPhase, InlineAggregator};
    use crate::error::DispatchError;
    use crate::util::book_day;
    use super::*;

    fn seed_cash(db: &LedgerDb, team_id: u64) -> u64 {
        db.insert_account(&NewAccount {
            account_key: keys::CASH,
            team_id,
            coa: Coa::Asset,
            balance_type: BalanceType::Debit,
            name: "Cash",
            can_adjust: true,
        })
        .expect("account")
        .id
    }

    struct Counting {
        phase: HandlerPhase,
        calls: AtomicUsize,
        fail: bool,
    }

    impl DailyUpdateHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn phase(&self) -> HandlerPhase {
            self.phase
        }

        fn dispatch(
            &self,
            _cx: &DispatchContext<'_>,
            _payload: &DailyUpdatePayload,
        ) -> Result<(), DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DispatchError::Queue("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    fn counting(phase: HandlerPhase, fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            phase,
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn post_transfer(book: &BookManage<'_>, ref_id: &str) -> Result<(), LedgerError> {
        book.new_transaction()
            .ref_id(ref_id)
            .team_id(1)
            .created_by(1)
            .add_shop_id(42)
            .add_tags(["Flash Sale"])
            .add_type_label("marketplace", "shopee")
            .create()?;
        book.new_create_entry(1, 1)
            .from((keys::CASH, 1), 1200.0)
            .to((keys::CASH, 2), 1200.0)
            .commit()?;
        Ok(())
    }

    #[test]
    fn test_open_posts_and_aggregates_inline() {
        let db = test_db();
        let cash1 = seed_cash(&db, 1);
        seed_cash(&db, 2);
        let handlers = HandlerRegistry::builder()
            .register(Arc::new(InlineAggregator))
            .build();

        let committed = open(&Context::new(), &db, &handlers, |book| {
            post_transfer(book, "order#1")
        })
        .expect("open");

        let payload = committed.payload().expect("posted");
        assert_eq!(payload.entries.len(), 2);
        let extra = payload.label_extra.as_ref().expect("labels");
        assert_eq!(extra.shop_id, Some(42));
        assert_eq!(extra.tag_ids.len(), 1);

        let day = book_day(payload.entries[0].entry_time);
        let row = db
            .get_daily_balance(DailyBucket::Account, day, cash1, 1)
            .expect("query")
            .expect("row");
        assert_eq!(row.balance, -1200.0);
        let shop = db
            .get_daily_balance(DailyBucket::Shop(42), day, cash1, 1)
            .expect("query")
            .expect("shop row");
        assert_eq!(shop.credit, 1200.0);

        let tx = db
            .find_transaction_by_ref("order#1")
            .expect("query")
            .expect("tx");
        let labels = db.get_transaction_labels(tx.id).expect("labels");
        assert_eq!(labels.shop_ids, vec![42]);
        assert_eq!(labels.type_label_ids.len(), 1);
        assert_eq!(db.ensure_tag("flash_sale").expect("tag").id, labels.tag_ids[0]);
    }

    #[test]
    fn test_handler_error_rolls_back() {
        let db = test_db();
        seed_cash(&db, 1);
        seed_cash(&db, 2);
        let handlers = HandlerRegistry::builder().build();
        let err = open(&Context::new(), &db, &handlers, |book| {
            post_transfer(book, "order#1")?;
            Err(LedgerError::Forbidden("nope".into()))
        })
        .expect_err("handler error");
        assert!(matches!(err, LedgerError::Forbidden(_)));
        assert_eq!(db.count_transactions().expect("count"), 0);
        assert_eq!(db.count_journal_entries().expect("count"), 0);
    }

    #[test]
    fn test_skip_discards_writes_without_dispatch() {
        let db = test_db();
        seed_cash(&db, 1);
        seed_cash(&db, 2);
        let before = counting(HandlerPhase::BeforeCommit, false);
        let after = counting(HandlerPhase::AfterCommit, false);
        let handlers = HandlerRegistry::builder()
            .register(before.clone())
            .register(after.clone())
            .build();
        let committed = open(&Context::new(), &db, &handlers, |book| {
            post_transfer(book, "order#77")?;
            Err(LedgerError::SkipTransaction)
        })
        .expect("skip is not an error");
        assert!(committed.is_skipped());
        assert_eq!(before.calls.load(Ordering::SeqCst), 0);
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
        assert_eq!(db.count_transactions().expect("count"), 0);
        assert_eq!(db.count_journal_entries().expect("count"), 0);
    }

    #[test]
    fn test_malformed_ref_id_is_rejected() {
        let db = test_db();
        let handlers = HandlerRegistry::builder().build();
        for bad in ["", "order", "order#", "#17"] {
            let err = open(&Context::new(), &db, &handlers, |book| {
                book.new_transaction().ref_id(bad).team_id(1).create()?;
                Ok(())
            })
            .expect_err("malformed ref");
            assert!(matches!(err, LedgerError::InvalidRefId(_)), "{bad:?}");
        }
        assert_eq!(db.count_transactions().expect("count"), 0);
    }

    #[test]
    fn test_empty_envelope_fails() {
        let db = test_db();
        let handlers = HandlerRegistry::builder().build();
        let err = open(&Context::new(), &db, &handlers, |book| {
            book.new_transaction().ref_id("order#9").team_id(1).create()?;
            Ok(())
        })
        .expect_err("no entries");
        assert!(matches!(err, LedgerError::EntriesEmpty));
        assert_eq!(db.count_transactions().expect("count"), 0);
    }

    #[test]
    fn test_before_commit_failure_rolls_back() {
        let db = test_db();
        seed_cash(&db, 1);
        seed_cash(&db, 2);
        let before = counting(HandlerPhase::BeforeCommit, true);
        let handlers = HandlerRegistry::builder().register(before.clone()).build();
        let err = open(&Context::new(), &db, &handlers, |book| {
            post_transfer(book, "order#1")
        })
        .expect_err("dispatch failure");
        assert!(matches!(err, LedgerError::Dispatch(_)));
        assert_eq!(before.calls.load(Ordering::SeqCst), 1);
        assert_eq!(db.count_journal_entries().expect("count"), 0);
    }

    #[test]
    fn test_after_commit_failure_keeps_posting() {
        let db = test_db();
        seed_cash(&db, 1);
        seed_cash(&db, 2);
        let after = counting(HandlerPhase::AfterCommit, true);
        let handlers = HandlerRegistry::builder().register(after.clone()).build();
        let err = open(&Context::new(), &db, &handlers, |book| {
            post_transfer(book, "order#1")
        })
        .expect_err("dispatch failure");
        assert!(matches!(err, LedgerError::Dispatch(_)));
        assert_eq!(db.count_journal_entries().expect("count"), 2);
    }

    #[test]
    fn test_cancelled_context_rolls_back() {
        let db = test_db();
        seed_cash(&db, 1);
        seed_cash(&db, 2);
        let handlers = HandlerRegistry::builder().build();
        let ctx = Context::new();
        let err = open(&ctx, &db, &handlers, |book| {
            post_transfer(book, "order#1")?;
            ctx.cancel();
            Ok(())
        })
        .expect_err("cancelled");
        assert!(matches!(err, LedgerError::Cancelled));
        assert_eq!(db.count_transactions().expect("count"), 0);
    }

    #[test]
    fn test_panicking_handler_rolls_back() {
        let db = test_db();
        seed_cash(&db, 1);
        seed_cash(&db, 2);
        let handlers = HandlerRegistry::builder().build();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = open(&Context::new(), &db, &handlers, |book| {
                post_transfer(book, "order#1").expect("post");
                panic!("handler bug");
            });
        }));
        assert!(result.is_err());
        assert_eq!(db.count_transactions().expect("count"), 0);
    }
}
