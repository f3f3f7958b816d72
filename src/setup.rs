//! Team onboarding and account maintenance.

use crate::accounts::seed;
use crate::db::accounts::NewAccount;
use crate::db::{Account, BalanceType, Coa, LedgerDb};
use crate::error::LedgerError;
use crate::labels::seed_type_labels;

/// Insert the reserved-key catalog for a team. Keys the team already has are
/// left untouched, so this can be re-run after the catalog grows.
///
/// Returns the number of accounts created.
pub fn setup_team(db: &LedgerDb, team_id: u64) -> Result<usize, LedgerError> {
    let created = db.with_transaction(|db| {
        let mut created = 0;
        for entry in seed() {
            let inserted = db.insert_account_if_missing(&NewAccount {
                account_key: entry.key,
                team_id,
                coa: entry.coa,
                balance_type: entry.balance_type,
                name: entry.name,
                can_adjust: entry.can_adjust,
            })?;
            if inserted {
                created += 1;
            }
        }
        Ok::<_, LedgerError>(created)
    })?;
    log::info!(
        "Setup: team {} has {} reserved accounts ({} new)",
        team_id,
        seed().len(),
        created
    );
    Ok(created)
}

/// Set up a team and the shared type-label enumeration in one call.
pub fn bootstrap(db: &LedgerDb, team_id: u64) -> Result<usize, LedgerError> {
    seed_type_labels(db)?;
    setup_team(db, team_id)
}

/// Create a single custom account.
pub fn create_account(db: &LedgerDb, account: &NewAccount<'_>) -> Result<Account, LedgerError> {
    let created = db.insert_account(account)?;
    log::info!(
        "Setup: created account {} ({}) for team {}",
        created.id,
        created.account_key,
        created.team_id
    );
    Ok(created)
}

/// Fix an account created with the wrong category or sign convention.
///
/// Existing daily aggregates keep the old sign; run a rebuild afterwards.
pub fn correct_account(
    db: &LedgerDb,
    account_id: u64,
    coa: Coa,
    balance_type: BalanceType,
) -> Result<Account, LedgerError> {
    db.with_transaction(|db| {
        if !db.update_account_classification(account_id, coa, balance_type)? {
            return Err(LedgerError::AccountIdNotFound(account_id));
        }
        db.get_account(account_id)?
            .ok_or(LedgerError::AccountIdNotFound(account_id))
    })
}
