// Audit history
//
// Two append-only trails: payment_history records every lifecycle event of a
// payment, admin_history records owner-level administration (registration,
// tax changes, filter set changes, manual payment removal). Every event gets
// a uuid so entries stay addressable even if rows are ever exported.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ToSql};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{read_ts, write_ts};
use crate::entities::payment::PaymentStatus;
use crate::error::Result;

// ============================================================================
// MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAction {
    /// A payment entered the books (imported or manual).
    Added,
    /// A review or undo moved the payment to a new status.
    StatusChange,
}

impl PaymentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentAction::Added => "added",
            PaymentAction::StatusChange => "status_change",
        }
    }

    pub fn parse(s: &str) -> Option<PaymentAction> {
        match s {
            "added" => Some(PaymentAction::Added),
            "status_change" => Some(PaymentAction::StatusChange),
            _ => None,
        }
    }
}

impl ToSql for PaymentAction {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for PaymentAction {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        PaymentAction::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown payment action '{}'", s).into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    Add,
    Change,
    Delete,
}

impl AdminAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminAction::Add => "add",
            AdminAction::Change => "change",
            AdminAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<AdminAction> {
        match s {
            "add" => Some(AdminAction::Add),
            "change" => Some(AdminAction::Change),
            "delete" => Some(AdminAction::Delete),
            _ => None,
        }
    }
}

impl ToSql for AdminAction {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for AdminAction {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        AdminAction::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown admin action '{}'", s).into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEntry {
    pub id: i64,
    pub event_id: String,
    pub payment_id: i64,
    pub owner_id: i64,
    /// Display name of whoever acted ("System" for the rule engine).
    pub actor: String,
    pub action: PaymentAction,
    pub new_status: PaymentStatus,
    pub comment: String,
    pub details: Option<serde_json::Value>,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminEntry {
    pub id: i64,
    pub event_id: String,
    pub owner_id: i64,
    pub actor: String,
    pub action: AdminAction,
    pub comment: String,
    pub date: DateTime<Utc>,
}

// ============================================================================
// REPOSITORY
// ============================================================================

pub struct HistoryRepository;

impl HistoryRepository {
    /// Append a payment lifecycle event. Returns the event uuid.
    pub fn log_payment(
        conn: &Connection,
        owner_id: i64,
        payment_id: i64,
        actor: &str,
        action: PaymentAction,
        new_status: PaymentStatus,
        comment: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<String> {
        let event_id = Uuid::new_v4().to_string();
        let details_json = match details {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        conn.execute(
            "INSERT INTO payment_history (
                event_id, payment_id, owner_id, actor, action, new_status,
                comment, details, date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event_id,
                payment_id,
                owner_id,
                actor,
                action,
                new_status,
                comment,
                details_json,
                write_ts(Utc::now()),
            ],
        )?;
        Ok(event_id)
    }

    /// Append an owner administration event. Returns the event uuid.
    pub fn log_admin(
        conn: &Connection,
        owner_id: i64,
        actor: &str,
        action: AdminAction,
        comment: &str,
    ) -> Result<String> {
        let event_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO admin_history (event_id, owner_id, actor, action, comment, date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![event_id, owner_id, actor, action, comment, write_ts(Utc::now())],
        )?;
        Ok(event_id)
    }

    /// Full trail of one payment, oldest first.
    pub fn payment_trail(conn: &Connection, payment_id: i64) -> Result<Vec<PaymentEntry>> {
        let mut stmt = conn.prepare(
            "SELECT id, event_id, payment_id, owner_id, actor, action, new_status,
                    comment, details, date
             FROM payment_history WHERE payment_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![payment_id], map_payment_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Administration trail of one owner, oldest first.
    pub fn admin_trail(conn: &Connection, owner_id: i64) -> Result<Vec<AdminEntry>> {
        let mut stmt = conn.prepare(
            "SELECT id, event_id, owner_id, actor, action, comment, date
             FROM admin_history WHERE owner_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![owner_id], map_admin_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Remove a payment's trail ahead of deleting the payment itself. Only
    /// the manual-payment delete path uses this.
    pub fn delete_for_payment(conn: &Connection, payment_id: i64) -> Result<usize> {
        let removed = conn.execute(
            "DELETE FROM payment_history WHERE payment_id = ?1",
            params![payment_id],
        )?;
        Ok(removed)
    }
}

fn map_payment_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentEntry> {
    let details: Option<String> = row.get(8)?;
    let details = match details {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(PaymentEntry {
        id: row.get(0)?,
        event_id: row.get(1)?,
        payment_id: row.get(2)?,
        owner_id: row.get(3)?,
        actor: row.get(4)?,
        action: row.get(5)?,
        new_status: row.get(6)?,
        comment: row.get(7)?,
        details,
        date: read_ts(row.get(9)?)?,
    })
}

fn map_admin_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdminEntry> {
    Ok(AdminEntry {
        id: row.get(0)?,
        event_id: row.get(1)?,
        owner_id: row.get(2)?,
        actor: row.get(3)?,
        action: row.get(4)?,
        comment: row.get(5)?,
        date: read_ts(row.get(6)?)?,
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
    use crate::entities::payment::{NewPayment, PaymentRepository};
    use serde_json::json;

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
        let payment_id = PaymentRepository::insert(
            &conn,
            owner.id,
            &NewPayment {
                account_id: account.id,
                entry_id: Some(1),
                payer_name: "Orren Kalda".to_string(),
                amount: 1000,
                date: Utc::now(),
                reason: "donation".to_string(),
                status: PaymentStatus::Pending,
                reviser: None,
            },
        )
        .unwrap()
        .unwrap();
        (conn, owner.id, payment_id)
    }

    #[test]
    fn test_payment_trail_roundtrip() {
        let (conn, owner_id, payment_id) = test_conn();

        HistoryRepository::log_payment(
            &conn,
            owner_id,
            payment_id,
            "System",
            PaymentAction::Added,
            PaymentStatus::Pending,
            "Payment added.",
            Some(&json!({"amount": 1000})),
        )
        .unwrap();
        HistoryRepository::log_payment(
            &conn,
            owner_id,
            payment_id,
            "Vex Harlan",
            PaymentAction::StatusChange,
            PaymentStatus::Approved,
            "Payment approved.",
            None,
        )
        .unwrap();

        let trail = HistoryRepository::payment_trail(&conn, payment_id).unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].action, PaymentAction::Added);
        assert_eq!(trail[0].details, Some(json!({"amount": 1000})));
        assert_eq!(trail[1].new_status, PaymentStatus::Approved);
        assert_eq!(trail[1].actor, "Vex Harlan");
        assert_ne!(trail[0].event_id, trail[1].event_id);
    }

    #[test]
    fn test_delete_for_payment_is_scoped() {
        let (conn, owner_id, payment_id) = test_conn();
        let other = PaymentRepository::insert(
            &conn,
            owner_id,
            &NewPayment {
                account_id: 1,
                entry_id: Some(2),
                payer_name: "Orren Kalda".to_string(),
                amount: 500,
                date: Utc::now(),
                reason: "donation".to_string(),
                status: PaymentStatus::Pending,
                reviser: None,
            },
        )
        .unwrap()
        .unwrap();

        for pid in [payment_id, other] {
            HistoryRepository::log_payment(
                &conn,
                owner_id,
                pid,
                "System",
                PaymentAction::Added,
                PaymentStatus::Pending,
                "Payment added.",
                None,
            )
            .unwrap();
        }

        let removed = HistoryRepository::delete_for_payment(&conn, payment_id).unwrap();
        assert_eq!(removed, 1);
        assert!(HistoryRepository::payment_trail(&conn, payment_id).unwrap().is_empty());
        assert_eq!(HistoryRepository::payment_trail(&conn, other).unwrap().len(), 1);
    }

    #[test]
    fn test_admin_trail() {
        let (conn, owner_id, _) = test_conn();

        HistoryRepository::log_admin(
            &conn,
            owner_id,
            "Vex Harlan",
            AdminAction::Change,
            "Tax amount set to 2000.",
        )
        .unwrap();
        HistoryRepository::log_admin(
            &conn,
            owner_id,
            "Vex Harlan",
            AdminAction::Delete,
            "Manual payment 9 removed.",
        )
        .unwrap();

        let trail = HistoryRepository::admin_trail(&conn, owner_id).unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].action, AdminAction::Change);
        assert_eq!(trail[1].action, AdminAction::Delete);
    }
}
