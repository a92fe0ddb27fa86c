// Payment state machine
//
// The only code allowed to change a payment's status, move account balances
// or append payment audit entries. Every operation takes the caller's open
// transaction, so each transition commits or rolls back as one unit:
//
//   Pending ----------> Approved | Rejected | NeedsApproval
//   NeedsApproval ----> Approved | Rejected
//   Approved --------- undo ----> Pending   (credit reversed)
//   Rejected --------- undo ----> Pending   (no balance change)
//
// Imported payments (non-null entry id) are permanent records; only manual
// payments can be deleted, with a compensating reversal when approved.

use chrono::{DateTime, Utc};
use rusqlite::Transaction;
use serde_json::json;
use tracing::info;

use crate::entities::{
    AccountRepository, AdminAction, HistoryRepository, NewPayment, Payment, PaymentAction,
    PaymentRepository, PaymentStatus, Reviser,
};
use crate::error::{Error, Result};

/// Approve a pending or flagged payment: credit the account, stamp the
/// reviser, append the audit entry.
pub fn approve(
    tx: &Transaction<'_>,
    owner_id: i64,
    payment_id: i64,
    reviser: &Reviser,
    comment: &str,
) -> Result<Payment> {
    let payment = PaymentRepository::get_for_owner(tx, owner_id, payment_id)?;
    if !payment.is_reviewable() {
        return Err(Error::InvalidTransition {
            action: "approve",
            state: payment.status.to_string(),
        });
    }

    AccountRepository::credit(tx, payment.account_id, payment.amount)?;
    PaymentRepository::set_status(tx, payment.id, PaymentStatus::Approved, &Some(reviser.clone()))?;
    HistoryRepository::log_payment(
        tx,
        owner_id,
        payment.id,
        reviser.display_name(),
        PaymentAction::StatusChange,
        PaymentStatus::Approved,
        comment,
        None,
    )?;

    info!(payment = payment.id, amount = payment.amount, "payment approved");
    PaymentRepository::get(tx, payment.id)
}

/// Reject a pending or flagged payment. No balance effect.
pub fn reject(
    tx: &Transaction<'_>,
    owner_id: i64,
    payment_id: i64,
    reviser: &Reviser,
    comment: &str,
) -> Result<Payment> {
    let payment = PaymentRepository::get_for_owner(tx, owner_id, payment_id)?;
    if !payment.is_reviewable() {
        return Err(Error::InvalidTransition {
            action: "reject",
            state: payment.status.to_string(),
        });
    }

    PaymentRepository::set_status(tx, payment.id, PaymentStatus::Rejected, &Some(reviser.clone()))?;
    HistoryRepository::log_payment(
        tx,
        owner_id,
        payment.id,
        reviser.display_name(),
        PaymentAction::StatusChange,
        PaymentStatus::Rejected,
        comment,
        None,
    )?;

    info!(payment = payment.id, "payment rejected");
    PaymentRepository::get(tx, payment.id)
}

/// Put a decided payment back to pending. An approved payment gives its
/// credit back first; a rejected one credited nothing, so nothing moves.
pub fn undo(
    tx: &Transaction<'_>,
    owner_id: i64,
    payment_id: i64,
    reviser: &Reviser,
    comment: &str,
) -> Result<Payment> {
    let payment = PaymentRepository::get_for_owner(tx, owner_id, payment_id)?;
    if !payment.is_decided() {
        return Err(Error::InvalidTransition {
            action: "undo",
            state: payment.status.to_string(),
        });
    }

    if payment.status == PaymentStatus::Approved {
        AccountRepository::debit(tx, payment.account_id, payment.amount)?;
    }
    PaymentRepository::set_status(tx, payment.id, PaymentStatus::Pending, &None)?;
    HistoryRepository::log_payment(
        tx,
        owner_id,
        payment.id,
        reviser.display_name(),
        PaymentAction::StatusChange,
        PaymentStatus::Pending,
        comment,
        None,
    )?;

    info!(payment = payment.id, "payment undone");
    PaymentRepository::get(tx, payment.id)
}

/// Remove a manually entered payment. Imported payments are immutable
/// records and always refuse. An approved manual payment gives its credit
/// back before the rows go.
pub fn delete(
    tx: &Transaction<'_>,
    owner_id: i64,
    payment_id: i64,
    reviser: &Reviser,
) -> Result<()> {
    let payment = PaymentRepository::get_for_owner(tx, owner_id, payment_id)?;
    if payment.is_imported() {
        return Err(Error::ImmutableRecord);
    }

    if payment.status == PaymentStatus::Approved {
        AccountRepository::debit(tx, payment.account_id, payment.amount)?;
    }
    HistoryRepository::delete_for_payment(tx, payment.id)?;
    PaymentRepository::delete(tx, payment.id)?;
    HistoryRepository::log_admin(
        tx,
        owner_id,
        reviser.display_name(),
        AdminAction::Delete,
        &format!(
            "Manual payment {} ({}) for {} removed.",
            payment.id, payment.amount, payment.payer_name
        ),
    )?;

    info!(payment = payment.id, "manual payment deleted");
    Ok(())
}

/// Enter a payment by hand. Manual payments are born approved and credited
/// immediately; they carry no entry id, so they stay deletable.
pub fn add_manual(
    tx: &Transaction<'_>,
    owner_id: i64,
    account_id: i64,
    amount: i64,
    date: DateTime<Utc>,
    reason: &str,
    reviser: &Reviser,
) -> Result<Payment> {
    if amount == 0 {
        return Err(Error::Validation {
            field: "amount",
            reason: "must not be zero".to_string(),
        });
    }

    let account = AccountRepository::get(tx, account_id)?;
    if account.owner_id != owner_id {
        return Err(Error::NotFound {
            entity: "Payer account",
            id: account_id,
        });
    }

    let payment_id = PaymentRepository::insert(
        tx,
        owner_id,
        &NewPayment {
            account_id,
            entry_id: None,
            payer_name: account.name.clone(),
            amount,
            date,
            reason: reason.to_string(),
            status: PaymentStatus::Approved,
            reviser: Some(reviser.clone()),
        },
    )?
    .ok_or(Error::AlreadyExists { entity: "Payment" })?;

    AccountRepository::credit(tx, account_id, amount)?;
    HistoryRepository::log_payment(
        tx,
        owner_id,
        payment_id,
        reviser.display_name(),
        PaymentAction::Added,
        PaymentStatus::Approved,
        "Payment added.",
        Some(&json!({ "amount": amount, "reason": reason })),
    )?;
    HistoryRepository::log_admin(
        tx,
        owner_id,
        reviser.display_name(),
        AdminAction::Add,
        &format!("Manual payment of {} added for {}.", amount, account.name),
    )?;

    info!(payment = payment_id, amount, "manual payment added");
    PaymentRepository::get(tx, payment_id)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::entities::{OwnerKind, OwnerRepository};
    use rusqlite::Connection;

    fn setup() -> (Connection, i64, i64) {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let owner = OwnerRepository::register(
            &conn,
            OwnerKind::Corporation,
            98000001,
            "Test Corp",
            1000,
            30,
            Utc::now(),
        )
        .unwrap();
        let account =
            AccountRepository::create(&conn, owner.id, 9001, "Orren Kalda", Utc::now()).unwrap();
        (conn, owner.id, account.id)
    }

    fn imported(conn: &Connection, owner_id: i64, account_id: i64, entry_id: i64, amount: i64) -> i64 {
        PaymentRepository::insert(
            conn,
            owner_id,
            &NewPayment {
                account_id,
                entry_id: Some(entry_id),
                payer_name: "Orren Kalda".to_string(),
                amount,
                date: Utc::now(),
                reason: "donation".to_string(),
                status: PaymentStatus::Pending,
                reviser: None,
            },
        )
        .unwrap()
        .unwrap()
    }

    fn deposit(conn: &Connection, account_id: i64) -> i64 {
        AccountRepository::get(conn, account_id).unwrap().deposit
    }

    fn human() -> Reviser {
        Reviser::Human("Vex Harlan".to_string())
    }

    #[test]
    fn test_approve_credits_and_stamps() {
        let (mut conn, owner_id, account_id) = setup();
        let payment_id = imported(&conn, owner_id, account_id, 1, 1500);

        let tx = conn.transaction().unwrap();
        let payment = approve(&tx, owner_id, payment_id, &human(), "Payment approved.").unwrap();
        tx.commit().unwrap();

        assert_eq!(payment.status, PaymentStatus::Approved);
        assert_eq!(payment.reviser, Some(human()));
        assert_eq!(deposit(&conn, account_id), 1500);

        let trail = HistoryRepository::payment_trail(&conn, payment_id).unwrap();
        assert_eq!(trail.last().unwrap().actor, "Vex Harlan");
        assert_eq!(trail.last().unwrap().new_status, PaymentStatus::Approved);
    }

    #[test]
    fn test_approve_twice_is_invalid() {
        let (mut conn, owner_id, account_id) = setup();
        let payment_id = imported(&conn, owner_id, account_id, 1, 1500);

        let tx = conn.transaction().unwrap();
        approve(&tx, owner_id, payment_id, &human(), "Payment approved.").unwrap();
        let err = approve(&tx, owner_id, payment_id, &human(), "again").unwrap_err();
        tx.commit().unwrap();

        assert!(matches!(err, Error::InvalidTransition { action: "approve", .. }));
        assert_eq!(deposit(&conn, account_id), 1500, "no double credit");
    }

    #[test]
    fn test_approve_undo_approve_balance_roundtrip() {
        let (mut conn, owner_id, account_id) = setup();
        let payment_id = imported(&conn, owner_id, account_id, 1, 2000);

        let tx = conn.transaction().unwrap();
        approve(&tx, owner_id, payment_id, &human(), "Payment approved.").unwrap();
        undo(&tx, owner_id, payment_id, &human(), "Payment undone.").unwrap();
        tx.commit().unwrap();

        assert_eq!(deposit(&conn, account_id), 0, "undo reverses the credit");
        let payment = PaymentRepository::get(&conn, payment_id).unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.reviser.is_none(), "undo clears the reviser");

        let tx = conn.transaction().unwrap();
        approve(&tx, owner_id, payment_id, &human(), "Payment approved.").unwrap();
        tx.commit().unwrap();
        assert_eq!(deposit(&conn, account_id), 2000, "same as a single approve");
    }

    #[test]
    fn test_undo_rejected_moves_no_money() {
        let (mut conn, owner_id, account_id) = setup();
        let payment_id = imported(&conn, owner_id, account_id, 1, 2000);

        let tx = conn.transaction().unwrap();
        reject(&tx, owner_id, payment_id, &human(), "Payment rejected.").unwrap();
        assert_eq!(
            PaymentRepository::get(&tx, payment_id).unwrap().reviser,
            Some(human())
        );
        undo(&tx, owner_id, payment_id, &human(), "Payment undone.").unwrap();
        tx.commit().unwrap();

        assert_eq!(deposit(&conn, account_id), 0);
        let payment = PaymentRepository::get(&conn, payment_id).unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
    }

    #[test]
    fn test_undo_from_pending_is_invalid() {
        let (mut conn, owner_id, account_id) = setup();
        let payment_id = imported(&conn, owner_id, account_id, 1, 2000);

        let tx = conn.transaction().unwrap();
        let err = undo(&tx, owner_id, payment_id, &human(), "Payment undone.").unwrap_err();
        tx.commit().unwrap();

        assert!(matches!(err, Error::InvalidTransition { action: "undo", .. }));
        assert_eq!(deposit(&conn, account_id), 0);
        let payment = PaymentRepository::get(&conn, payment_id).unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending, "payment untouched");
    }

    #[test]
    fn test_imported_payment_never_deletable() {
        let (mut conn, owner_id, account_id) = setup();
        let payment_id = imported(&conn, owner_id, account_id, 1, 2000);

        let tx = conn.transaction().unwrap();
        approve(&tx, owner_id, payment_id, &human(), "Payment approved.").unwrap();
        let err = delete(&tx, owner_id, payment_id, &human()).unwrap_err();
        tx.commit().unwrap();

        assert!(matches!(err, Error::ImmutableRecord));
        let payment = PaymentRepository::get(&conn, payment_id).unwrap();
        assert_eq!(payment.status, PaymentStatus::Approved, "nothing mutated");
        assert_eq!(deposit(&conn, account_id), 2000);
    }

    #[test]
    fn test_manual_payment_lifecycle() {
        let (mut conn, owner_id, account_id) = setup();

        let tx = conn.transaction().unwrap();
        let payment = add_manual(
            &tx,
            owner_id,
            account_id,
            750,
            Utc::now(),
            "cash adjustment",
            &human(),
        )
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(payment.status, PaymentStatus::Approved);
        assert!(payment.entry_id.is_none());
        assert_eq!(deposit(&conn, account_id), 750);

        let tx = conn.transaction().unwrap();
        delete(&tx, owner_id, payment.id, &human()).unwrap();
        tx.commit().unwrap();

        assert_eq!(deposit(&conn, account_id), 0, "approved delete reverses the credit");
        assert!(PaymentRepository::get(&conn, payment.id).is_err());
        assert!(HistoryRepository::payment_trail(&conn, payment.id).unwrap().is_empty());

        let admin = HistoryRepository::admin_trail(&conn, owner_id).unwrap();
        assert_eq!(admin.first().unwrap().action, AdminAction::Add);
        assert_eq!(admin.last().unwrap().action, AdminAction::Delete);
    }

    #[test]
    fn test_delete_undone_manual_payment_moves_no_money() {
        let (mut conn, owner_id, account_id) = setup();

        let tx = conn.transaction().unwrap();
        let payment = add_manual(&tx, owner_id, account_id, 750, Utc::now(), "adj", &human()).unwrap();
        undo(&tx, owner_id, payment.id, &human(), "Payment undone.").unwrap();
        tx.commit().unwrap();
        assert_eq!(deposit(&conn, account_id), 0);

        let tx = conn.transaction().unwrap();
        delete(&tx, owner_id, payment.id, &human()).unwrap();
        tx.commit().unwrap();
        assert_eq!(deposit(&conn, account_id), 0);
    }

    #[test]
    fn test_manual_payment_zero_amount_rejected() {
        let (mut conn, owner_id, account_id) = setup();

        let tx = conn.transaction().unwrap();
        let err = add_manual(&tx, owner_id, account_id, 0, Utc::now(), "noop", &human()).unwrap_err();
        tx.commit().unwrap();

        assert!(matches!(err, Error::Validation { field: "amount", .. }));
    }

    #[test]
    fn test_foreign_owner_sees_not_found() {
        let (mut conn, owner_id, account_id) = setup();
        let other = OwnerRepository::register(
            &conn,
            OwnerKind::Alliance,
            99000001,
            "Other",
            500,
            7,
            Utc::now(),
        )
        .unwrap();
        let payment_id = imported(&conn, owner_id, account_id, 1, 100);

        let tx = conn.transaction().unwrap();
        let err = approve(&tx, other.id, payment_id, &human(), "Payment approved.").unwrap_err();
        tx.commit().unwrap();

        assert!(matches!(err, Error::NotFound { entity: "Payment", .. }));
    }
}
