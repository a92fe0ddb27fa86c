// Payment - one matched or manually entered transaction against an account
//
// Imported payments carry the ledger entry id they came from and are unique
// per (owner, entry id); manual payments have no entry id, and several of
// them may coexist. All mutation goes through the state machine in
// `crate::payments`.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::db::{read_ts, write_ts};
use crate::error::{Error, Result};

// ============================================================================
// MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    NeedsApproval,
    Approved,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::NeedsApproval => "needs_approval",
            PaymentStatus::Approved => "approved",
            PaymentStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<PaymentStatus> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "needs_approval" => Some(PaymentStatus::NeedsApproval),
            "approved" => Some(PaymentStatus::Approved),
            "rejected" => Some(PaymentStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for PaymentStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for PaymentStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        PaymentStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown payment status '{}'", s).into()))
    }
}

/// Who decided a payment. Automatic decisions come from the rule engine;
/// everything else carries the reviewer's name. Stored as a kind column plus
/// an optional name column, so no sentinel strings live in the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Reviser {
    Automatic,
    Human(String),
}

impl Reviser {
    /// Display label for audit trails and user-facing tables.
    pub fn display_name(&self) -> &str {
        match self {
            Reviser::Automatic => "System",
            Reviser::Human(name) => name,
        }
    }

    fn kind_str(&self) -> &'static str {
        match self {
            Reviser::Automatic => "automatic",
            Reviser::Human(_) => "human",
        }
    }

    fn from_columns(
        kind: Option<String>,
        name: Option<String>,
    ) -> rusqlite::Result<Option<Reviser>> {
        match kind.as_deref() {
            None => Ok(None),
            Some("automatic") => Ok(Some(Reviser::Automatic)),
            Some("human") => Ok(Some(Reviser::Human(name.unwrap_or_default()))),
            Some(other) => Err(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown reviser kind '{}'", other).into(),
            )),
        }
    }
}

fn reviser_columns(reviser: &Option<Reviser>) -> (Option<&'static str>, Option<&str>) {
    match reviser {
        None => (None, None),
        Some(r @ Reviser::Automatic) => (Some(r.kind_str()), None),
        Some(r @ Reviser::Human(name)) => (Some(r.kind_str()), Some(name.as_str())),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub owner_id: i64,
    pub account_id: i64,
    /// External ledger entry id; None for manually entered payments.
    pub entry_id: Option<i64>,
    pub payer_name: String,
    pub amount: i64,
    pub date: DateTime<Utc>,
    pub reason: String,
    pub status: PaymentStatus,
    pub reviser: Option<Reviser>,
}

impl Payment {
    pub fn is_imported(&self) -> bool {
        self.entry_id.is_some()
    }

    /// Reviewable = approve/reject may act on it.
    pub fn is_reviewable(&self) -> bool {
        matches!(
            self.status,
            PaymentStatus::Pending | PaymentStatus::NeedsApproval
        )
    }

    /// Undo may act on decided payments only.
    pub fn is_decided(&self) -> bool {
        matches!(
            self.status,
            PaymentStatus::Approved | PaymentStatus::Rejected
        )
    }
}

/// Row to insert; ids are assigned by the database.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub account_id: i64,
    pub entry_id: Option<i64>,
    pub payer_name: String,
    pub amount: i64,
    pub date: DateTime<Utc>,
    pub reason: String,
    pub status: PaymentStatus,
    pub reviser: Option<Reviser>,
}

// ============================================================================
// REPOSITORY
// ============================================================================

pub struct PaymentRepository;

impl PaymentRepository {
    /// Insert a payment. Returns the new row id, or None when the
    /// (owner, entry id) pair already exists - the dedup no-op.
    pub fn insert(conn: &Connection, owner_id: i64, new: &NewPayment) -> Result<Option<i64>> {
        let (reviser_kind, reviser_name) = reviser_columns(&new.reviser);
        let result = conn.execute(
            "INSERT INTO payments (
                owner_id, account_id, entry_id, payer_name, amount, date, reason,
                status, reviser_kind, reviser_name
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                owner_id,
                new.account_id,
                new.entry_id,
                new.payer_name,
                new.amount,
                write_ts(new.date),
                new.reason,
                new.status,
                reviser_kind,
                reviser_name,
            ],
        );

        match result {
            Ok(_) => Ok(Some(conn.last_insert_rowid())),
            // Only the (owner_id, entry_id) uniqueness race is a dedup no-op;
            // other constraint failures (foreign keys) are real errors.
            Err(rusqlite::Error::SqliteFailure(err, msg))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
                    && new.entry_id.is_some()
                    && msg
                        .as_deref()
                        .map_or(false, |m| m.contains("payments.entry_id")) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Payment> {
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_PAYMENT),
            params![id],
            map_payment,
        )
        .optional()?
        .ok_or(Error::NotFound {
            entity: "Payment",
            id,
        })
    }

    /// Fetch a payment scoped to an owner. A payment belonging to a different
    /// owner is NotFound from that owner's point of view.
    pub fn get_for_owner(conn: &Connection, owner_id: i64, id: i64) -> Result<Payment> {
        conn.query_row(
            &format!("{} WHERE id = ?1 AND owner_id = ?2", SELECT_PAYMENT),
            params![id, owner_id],
            map_payment,
        )
        .optional()?
        .ok_or(Error::NotFound {
            entity: "Payment",
            id,
        })
    }

    pub fn list_for_owner(conn: &Connection, owner_id: i64) -> Result<Vec<Payment>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE owner_id = ?1 ORDER BY date DESC, id DESC",
            SELECT_PAYMENT
        ))?;
        let payments = stmt
            .query_map(params![owner_id], map_payment)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(payments)
    }

    pub fn list_with_status(
        conn: &Connection,
        owner_id: i64,
        status: PaymentStatus,
    ) -> Result<Vec<Payment>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE owner_id = ?1 AND status = ?2 ORDER BY date DESC, id DESC",
            SELECT_PAYMENT
        ))?;
        let payments = stmt
            .query_map(params![owner_id, status], map_payment)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(payments)
    }

    pub fn list_for_account(conn: &Connection, account_id: i64) -> Result<Vec<Payment>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE account_id = ?1 ORDER BY date DESC, id DESC",
            SELECT_PAYMENT
        ))?;
        let payments = stmt
            .query_map(params![account_id], map_payment)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(payments)
    }

    /// Entry ids already turned into payments for this owner.
    pub fn imported_entry_ids(conn: &Connection, owner_id: i64) -> Result<HashSet<i64>> {
        let mut stmt = conn.prepare(
            "SELECT entry_id FROM payments WHERE owner_id = ?1 AND entry_id IS NOT NULL",
        )?;
        let ids = stmt
            .query_map(params![owner_id], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    pub fn set_status(
        conn: &Connection,
        id: i64,
        status: PaymentStatus,
        reviser: &Option<Reviser>,
    ) -> Result<()> {
        let (reviser_kind, reviser_name) = reviser_columns(reviser);
        let changed = conn.execute(
            "UPDATE payments SET status = ?1, reviser_kind = ?2, reviser_name = ?3 WHERE id = ?4",
            params![status, reviser_kind, reviser_name, id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "Payment",
                id,
            });
        }
        Ok(())
    }

    /// Physical removal. Only the state machine calls this, and only for
    /// manual payments after their history rows are gone.
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        let changed = conn.execute("DELETE FROM payments WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "Payment",
                id,
            });
        }
        Ok(())
    }
}

const SELECT_PAYMENT: &str = "SELECT id, owner_id, account_id, entry_id, payer_name, amount,
            date, reason, status, reviser_kind, reviser_name
     FROM payments";

fn map_payment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        account_id: row.get(2)?,
        entry_id: row.get(3)?,
        payer_name: row.get(4)?,
        amount: row.get(5)?,
        date: read_ts(row.get(6)?)?,
        reason: row.get(7)?,
        status: row.get(8)?,
        reviser: Reviser::from_columns(row.get(9)?, row.get(10)?)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::entities::account::AccountRepository;
    use crate::entities::owner::{OwnerKind, OwnerRepository};

    fn test_conn() -> (Connection, i64, i64) {
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
            AccountRepository::create(&conn, owner.id, 501, "Orren Kalda", Utc::now()).unwrap();
        (conn, owner.id, account.id)
    }

    fn imported_payment(account_id: i64, entry_id: i64, amount: i64) -> NewPayment {
        NewPayment {
            account_id,
            entry_id: Some(entry_id),
            payer_name: "Orren Kalda".to_string(),
            amount,
            date: Utc::now(),
            reason: "donation".to_string(),
            status: PaymentStatus::Pending,
            reviser: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let (conn, owner_id, account_id) = test_conn();

        let id = PaymentRepository::insert(&conn, owner_id, &imported_payment(account_id, 77, 1000))
            .unwrap()
            .expect("first insert succeeds");

        let payment = PaymentRepository::get(&conn, id).unwrap();
        assert_eq!(payment.entry_id, Some(77));
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.reviser.is_none());
        assert!(payment.is_imported());
    }

    #[test]
    fn test_duplicate_entry_is_noop() {
        let (conn, owner_id, account_id) = test_conn();

        let first =
            PaymentRepository::insert(&conn, owner_id, &imported_payment(account_id, 77, 1000))
                .unwrap();
        assert!(first.is_some());

        let second =
            PaymentRepository::insert(&conn, owner_id, &imported_payment(account_id, 77, 1000))
                .unwrap();
        assert!(second.is_none(), "same (owner, entry) inserts nothing");

        assert_eq!(
            PaymentRepository::list_for_owner(&conn, owner_id).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_foreign_key_failure_is_not_a_duplicate() {
        let (conn, owner_id, _) = test_conn();

        // No account 999 exists. The constraint failure must surface as a
        // storage error, not read as the (owner, entry) dedup no-op.
        let result = PaymentRepository::insert(&conn, owner_id, &imported_payment(999, 42, 100));
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(PaymentRepository::list_for_owner(&conn, owner_id)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_multiple_manual_payments_allowed() {
        let (conn, owner_id, account_id) = test_conn();

        let manual = NewPayment {
            account_id,
            entry_id: None,
            payer_name: "Orren Kalda".to_string(),
            amount: 500,
            date: Utc::now(),
            reason: "manual adjustment".to_string(),
            status: PaymentStatus::Approved,
            reviser: Some(Reviser::Human("Admin One".to_string())),
        };

        assert!(PaymentRepository::insert(&conn, owner_id, &manual).unwrap().is_some());
        assert!(PaymentRepository::insert(&conn, owner_id, &manual).unwrap().is_some());

        assert_eq!(
            PaymentRepository::list_for_owner(&conn, owner_id).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_reviser_roundtrip() {
        let (conn, owner_id, account_id) = test_conn();

        let id = PaymentRepository::insert(&conn, owner_id, &imported_payment(account_id, 1, 100))
            .unwrap()
            .unwrap();

        PaymentRepository::set_status(
            &conn,
            id,
            PaymentStatus::Approved,
            &Some(Reviser::Automatic),
        )
        .unwrap();
        let payment = PaymentRepository::get(&conn, id).unwrap();
        assert_eq!(payment.reviser, Some(Reviser::Automatic));
        assert_eq!(payment.reviser.as_ref().unwrap().display_name(), "System");

        PaymentRepository::set_status(
            &conn,
            id,
            PaymentStatus::Approved,
            &Some(Reviser::Human("Vex Harlan".to_string())),
        )
        .unwrap();
        let payment = PaymentRepository::get(&conn, id).unwrap();
        assert_eq!(
            payment.reviser,
            Some(Reviser::Human("Vex Harlan".to_string()))
        );

        PaymentRepository::set_status(&conn, id, PaymentStatus::Pending, &None).unwrap();
        let payment = PaymentRepository::get(&conn, id).unwrap();
        assert!(payment.reviser.is_none());
    }

    #[test]
    fn test_owner_scoping() {
        let (conn, owner_id, account_id) = test_conn();
        let other_owner = OwnerRepository::register(
            &conn,
            OwnerKind::Alliance,
            99000001,
            "Other Alliance",
            500,
            7,
            Utc::now(),
        )
        .unwrap();

        let id = PaymentRepository::insert(&conn, owner_id, &imported_payment(account_id, 5, 100))
            .unwrap()
            .unwrap();

        assert!(PaymentRepository::get_for_owner(&conn, owner_id, id).is_ok());
        assert!(PaymentRepository::get_for_owner(&conn, other_owner.id, id).is_err());
    }

    #[test]
    fn test_imported_entry_ids() {
        let (conn, owner_id, account_id) = test_conn();

        PaymentRepository::insert(&conn, owner_id, &imported_payment(account_id, 10, 100)).unwrap();
        PaymentRepository::insert(&conn, owner_id, &imported_payment(account_id, 11, 200)).unwrap();

        let manual = NewPayment {
            entry_id: None,
            ..imported_payment(account_id, 0, 50)
        };
        PaymentRepository::insert(&conn, owner_id, &manual).unwrap();

        let ids = PaymentRepository::imported_entry_ids(&conn, owner_id).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&10) && ids.contains(&11));
    }
}
