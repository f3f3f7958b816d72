//! Account registry: reserved keys, the seed catalog, and per-envelope
//! resolution of `(key, team_id)` into account rows.
//!
//! Keys are stable strings shared by every team (`cash`, `stock_ready`, ...);
//! each team owns one row per key. Inside an envelope the registry memoizes
//! every account it has loaded, keyed by account id, so the builder can look
//! up the sign convention of an account without another round-trip.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::db::{Account, BalanceType, Coa, LedgerDb};
use crate::error::LedgerError;

/// Reserved account keys.
pub mod keys {
    // Assets
    pub const CASH: &str = "cash";
    pub const BANK: &str = "bank";
    pub const STOCK_READY: &str = "stock_ready";
    pub const STOCK_PENDING: &str = "stock_pending";
    pub const STOCK_BROKEN: &str = "stock_broken";
    pub const RECEIVABLE: &str = "receivable";
    pub const MARKETPLACE_FUND: &str = "marketplace_fund";
    pub const ADS_BALANCE: &str = "ads_balance";
    pub const TEAM_RECEIVABLE: &str = "team_receivable";

    // Liabilities
    pub const PAYABLE: &str = "payable";
    pub const SUPPLIER_PAYABLE: &str = "supplier_payable";
    pub const TEAM_PAYABLE: &str = "team_payable";
    pub const CUSTOMER_DEPOSIT: &str = "customer_deposit";

    // Equity
    pub const OWNER_EQUITY: &str = "owner_equity";
    pub const RETAINED_EARNING: &str = "retained_earning";
    pub const OPENING_BALANCE: &str = "opening_balance";

    // Revenue
    pub const SALES_REVENUE: &str = "sales_revenue";
    pub const SHIPPING_REVENUE: &str = "shipping_revenue";
    pub const OTHER_REVENUE: &str = "other_revenue";
    pub const STOCK_ADJUSTMENT_GAIN: &str = "stock_adjustment_gain";

    // Expenses
    pub const COGS: &str = "cogs";
    pub const ADS_EXPENSE: &str = "ads_expense";
    pub const SHIPPING_EXPENSE: &str = "shipping_expense";
    pub const MARKETPLACE_FEE: &str = "marketplace_fee";
    pub const OPERATIONAL_EXPENSE: &str = "operational_expense";
    pub const STOCK_LOSS: &str = "stock_loss";
    pub const RETURN_LOSS: &str = "return_loss";
}

/// One entry of the reserved-key catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccountSeed {
    pub key: &'static str,
    pub name: &'static str,
    pub coa: Coa,
    pub balance_type: BalanceType,
    pub can_adjust: bool,
}

const fn seed_of(
    key: &'static str,
    name: &'static str,
    coa: Coa,
    balance_type: BalanceType,
    can_adjust: bool,
) -> AccountSeed {
    AccountSeed {
        key,
        name,
        coa,
        balance_type,
        can_adjust,
    }
}

static SEED: &[AccountSeed] = &[
    seed_of(keys::CASH, "Cash", Coa::Asset, BalanceType::Debit, true),
    seed_of(keys::BANK, "Bank", Coa::Asset, BalanceType::Debit, true),
    seed_of(keys::STOCK_READY, "Stock Ready", Coa::Asset, BalanceType::Debit, true),
    seed_of(keys::STOCK_PENDING, "Stock In Transit", Coa::Asset, BalanceType::Debit, false),
    seed_of(keys::STOCK_BROKEN, "Stock Broken", Coa::Asset, BalanceType::Debit, true),
    seed_of(keys::RECEIVABLE, "Receivable", Coa::Asset, BalanceType::Debit, true),
    seed_of(keys::MARKETPLACE_FUND, "Marketplace Fund", Coa::Asset, BalanceType::Debit, false),
    seed_of(keys::ADS_BALANCE, "Ads Balance", Coa::Asset, BalanceType::Debit, true),
    seed_of(keys::TEAM_RECEIVABLE, "Team Receivable", Coa::Asset, BalanceType::Debit, false),
    seed_of(keys::PAYABLE, "Payable", Coa::Liability, BalanceType::Credit, true),
    seed_of(keys::SUPPLIER_PAYABLE, "Supplier Payable", Coa::Liability, BalanceType::Credit, false),
    seed_of(keys::TEAM_PAYABLE, "Team Payable", Coa::Liability, BalanceType::Credit, false),
    seed_of(keys::CUSTOMER_DEPOSIT, "Customer Deposit", Coa::Liability, BalanceType::Credit, false),
    seed_of(keys::OWNER_EQUITY, "Owner Equity", Coa::Equity, BalanceType::Credit, true),
    seed_of(keys::RETAINED_EARNING, "Retained Earning", Coa::Equity, BalanceType::Credit, false),
    seed_of(keys::OPENING_BALANCE, "Opening Balance", Coa::Equity, BalanceType::Credit, true),
    seed_of(keys::SALES_REVENUE, "Sales Revenue", Coa::Revenue, BalanceType::Credit, false),
    seed_of(keys::SHIPPING_REVENUE, "Shipping Revenue", Coa::Revenue, BalanceType::Credit, false),
    seed_of(keys::OTHER_REVENUE, "Other Revenue", Coa::Revenue, BalanceType::Credit, true),
    seed_of(keys::STOCK_ADJUSTMENT_GAIN, "Stock Adjustment Gain", Coa::Revenue, BalanceType::Credit, false),
    seed_of(keys::COGS, "Cost of Goods Sold", Coa::Expense, BalanceType::Debit, false),
    seed_of(keys::ADS_EXPENSE, "Ads Expense", Coa::Expense, BalanceType::Debit, false),
    seed_of(keys::SHIPPING_EXPENSE, "Shipping Expense", Coa::Expense, BalanceType::Debit, false),
    seed_of(keys::MARKETPLACE_FEE, "Marketplace Fee", Coa::Expense, BalanceType::Debit, false),
    seed_of(keys::OPERATIONAL_EXPENSE, "Operational Expense", Coa::Expense, BalanceType::Debit, true),
    seed_of(keys::STOCK_LOSS, "Stock Loss", Coa::Expense, BalanceType::Debit, false),
    seed_of(keys::RETURN_LOSS, "Return Loss", Coa::Expense, BalanceType::Debit, false),
];

/// The fixed reserved-key catalog consumed by team setup.
pub fn seed() -> &'static [AccountSeed] {
    SEED
}

/// Catalog entry for a reserved key.
pub fn seed_for(key: &str) -> Option<&'static AccountSeed> {
    SEED.iter().find(|s| s.key == key)
}

/// Memoizing account resolver scoped to one envelope.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    by_id: Mutex<HashMap<u64, Account>>,
    by_key: Mutex<HashMap<(String, u64), u64>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `(key, team_id)` through `db`, caching the row.
    ///
    /// `lock` asks for the row to be held for the rest of the envelope. The
    /// envelope's `BEGIN IMMEDIATE` already holds the database write
    /// reservation, so no extra statement is issued.
    pub fn resolve(
        &self,
        db: &LedgerDb,
        key: &str,
        team_id: u64,
        lock: bool,
    ) -> Result<Account, LedgerError> {
        let cached = self.by_key.lock().get(&(key.to_string(), team_id)).copied();
        if let Some(account) = cached.and_then(|id| self.get(id)) {
            return Ok(account);
        }

        if lock {
            log::debug!("AccountRegistry: resolving {}:{} for update", key, team_id);
        }
        let account = db
            .find_account_by_key(key, team_id)?
            .ok_or_else(|| LedgerError::AccountNotFound {
                key: key.to_string(),
                team_id,
            })?;
        self.remember(account.clone());
        Ok(account)
    }

    /// Resolve by id, reading through `db` on a cache miss.
    pub fn load(&self, db: &LedgerDb, account_id: u64) -> Result<Account, LedgerError> {
        if let Some(account) = self.get(account_id) {
            return Ok(account);
        }
        let account = db
            .get_account(account_id)?
            .ok_or(LedgerError::AccountIdNotFound(account_id))?;
        self.remember(account.clone());
        Ok(account)
    }

    /// A previously resolved account.
    pub fn get(&self, account_id: u64) -> Option<Account> {
        self.by_id.lock().get(&account_id).cloned()
    }

    /// Number of distinct accounts resolved so far.
    pub fn len(&self) -> usize {
        self.by_id.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.lock().is_empty()
    }

    fn remember(&self, account: Account) {
        self.by_key
            .lock()
            .insert((account.account_key.clone(), account.team_id), account.id);
        self.by_id.lock().insert(account.id, account);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::db::accounts::NewAccount;
    use crate::db::test_utils::test_db;
    use super::*;

    #[test]
    fn test_seed_keys_are_unique_and_follow_coa() {
        let mut seen = HashSet::new();
        for seed in seed() {
            assert!(seen.insert(seed.key), "duplicate seed key {}", seed.key);
            assert_eq!(
                seed.balance_type,
                seed.coa.natural_balance(),
                "{} has an unnatural balance type",
                seed.key
            );
        }
        assert!(seed_for(keys::CASH).is_some());
        assert!(seed_for("nope").is_none());
    }

    #[test]
    fn test_resolve_caches_by_id() {
        let db = test_db();
        let created = db
            .insert_account(&NewAccount {
                account_key: keys::CASH,
                team_id: 1,
                coa: Coa::Asset,
                balance_type: BalanceType::Debit,
                name: "Cash",
                can_adjust: true,
            })
            .expect("insert");

        let registry = AccountRegistry::new();
        assert!(registry.get(created.id).is_none());
        let resolved = registry.resolve(&db, keys::CASH, 1, true).expect("resolve");
        assert_eq!(resolved.id, created.id);
        assert_eq!(registry.get(created.id), Some(resolved));

        // Second resolution is served from the cache even if the row changes.
        db.update_account_classification(created.id, Coa::Liability, BalanceType::Credit)
            .expect("update");
        let cached = registry.resolve(&db, keys::CASH, 1, false).expect("cached");
        assert_eq!(cached.balance_type, BalanceType::Debit);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_missing_account() {
        let db = test_db();
        let registry = AccountRegistry::new();
        let err = registry
            .resolve(&db, keys::CASH, 7, false)
            .expect_err("missing");
        assert!(matches!(err, LedgerError::AccountNotFound { team_id: 7, .. }));
        assert!(matches!(
            registry.load(&db, 99).expect_err("missing id"),
            LedgerError::AccountIdNotFound(99)
        ));
    }
}
