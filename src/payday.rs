// Payday processor
//
// Periodic dues sweep. Active accounts only; an account that was never
// billed gets its clock started instead of a charge (first period free),
// everyone past the period is debited the owner's tax amount and restamped.
// The debit and the stamp land in one statement, so an account is charged
// for a period exactly once no matter how often the sweep reruns.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::entities::{AccountRepository, AccountStatus, Owner, OwnerRepository, PayerAccount};
use crate::error::Result;

/// Counters for one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PaydayOutcome {
    pub processed: usize,
    pub first_period: usize,
    pub debited: usize,
}

impl PaydayOutcome {
    pub fn summary(&self) -> String {
        format!(
            "{} active accounts, {} started their first period, {} debited",
            self.processed, self.first_period, self.debited
        )
    }
}

/// Charge dues on every active account of the owner.
pub fn run(conn: &mut Connection, owner_id: i64) -> Result<PaydayOutcome> {
    let owner = OwnerRepository::get(conn, owner_id)?;
    let now = Utc::now();

    let tx = conn.transaction()?;
    let accounts = AccountRepository::list_with_status(&tx, owner.id, AccountStatus::Active)?;
    let mut outcome = PaydayOutcome {
        processed: accounts.len(),
        ..PaydayOutcome::default()
    };

    for account in &accounts {
        match account.last_paid {
            None => {
                AccountRepository::set_last_paid(&tx, account.id, Some(now))?;
                outcome.first_period += 1;
            }
            Some(last_paid) if now - last_paid >= Duration::days(owner.tax_period_days) => {
                AccountRepository::debit_and_stamp(&tx, account.id, owner.tax_amount, now)?;
                outcome.debited += 1;
            }
            Some(_) => {}
        }
    }
    tx.commit()?;

    info!(owner = %owner.name, "payday: {}", outcome.summary());
    Ok(outcome)
}

/// Whether an account counts as paid up: the deposit covers a full period,
/// or the balance is non-negative and the last charge is still inside the
/// running period.
pub fn has_paid(account: &PayerAccount, owner: &Owner, now: DateTime<Utc>) -> bool {
    if account.deposit >= owner.tax_amount {
        return true;
    }
    match account.last_paid {
        Some(last_paid) if account.deposit >= 0 => {
            now - last_paid < Duration::days(owner.tax_period_days)
        }
        _ => false,
    }
}

// ============================================================================
// TESTS
// ============================================================================
