// Owner - a taxing organization (corporation or alliance)
//
// Both kinds behave identically in the engine; the kind tag only tells the
// surrounding system which external organization the roster covers.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};

use crate::db::{read_opt_ts, read_ts, write_ts};
use crate::error::{Error, Result};

// ============================================================================
// MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
    Corporation,
    Alliance,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Corporation => "corporation",
            OwnerKind::Alliance => "alliance",
        }
    }

    pub fn parse(s: &str) -> Option<OwnerKind> {
        match s {
            "corporation" => Some(OwnerKind::Corporation),
            "alliance" => Some(OwnerKind::Alliance),
            _ => None,
        }
    }
}

impl std::fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for OwnerKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for OwnerKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        OwnerKind::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown owner kind '{}'", s).into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Owner {
    pub id: i64,
    /// External organization id (corporation/alliance id in the game).
    pub external_id: i64,
    pub kind: OwnerKind,
    pub name: String,
    /// Currency units owed per billing period.
    pub tax_amount: i64,
    /// Billing period length in days.
    pub tax_period_days: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_member_sync: Option<DateTime<Utc>>,
    pub last_import: Option<DateTime<Utc>>,
    pub last_rule_run: Option<DateTime<Utc>>,
    pub last_payday: Option<DateTime<Utc>>,
}

/// Sections whose last successful run is stamped on the owner row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSection {
    MemberSync,
    Import,
    RuleRun,
    Payday,
}

impl UpdateSection {
    fn column(&self) -> &'static str {
        match self {
            UpdateSection::MemberSync => "last_member_sync",
            UpdateSection::Import => "last_import",
            UpdateSection::RuleRun => "last_rule_run",
            UpdateSection::Payday => "last_payday",
        }
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

pub struct OwnerRepository;

impl OwnerRepository {
    /// Register a new owner. The external organization id is unique; a second
    /// registration for the same organization is rejected.
    pub fn register(
        conn: &Connection,
        kind: OwnerKind,
        external_id: i64,
        name: &str,
        tax_amount: i64,
        tax_period_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Owner> {
        validate_tax_amount(tax_amount)?;
        validate_tax_period(tax_period_days)?;

        let result = conn.execute(
            "INSERT INTO owners (external_id, kind, name, tax_amount, tax_period_days, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![external_id, kind, name, tax_amount, tax_period_days, write_ts(now)],
        );

        match result {
            Ok(_) => Self::get(conn, conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists { entity: "Owner" })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Owner> {
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_OWNER),
            params![id],
            map_owner,
        )
        .optional()?
        .ok_or(Error::NotFound {
            entity: "Owner",
            id,
        })
    }

    /// Lookup by external organization id. Returns None when the organization
    /// is not registered here (relocation tolerates that).
    pub fn get_by_external(conn: &Connection, external_id: i64) -> Result<Option<Owner>> {
        let owner = conn
            .query_row(
                &format!("{} WHERE external_id = ?1", SELECT_OWNER),
                params![external_id],
                map_owner,
            )
            .optional()?;
        Ok(owner)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Owner>> {
        let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT_OWNER))?;
        let owners = stmt
            .query_map([], map_owner)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(owners)
    }

    pub fn update_tax_amount(conn: &Connection, id: i64, tax_amount: i64) -> Result<()> {
        validate_tax_amount(tax_amount)?;
        let changed = conn.execute(
            "UPDATE owners SET tax_amount = ?1 WHERE id = ?2",
            params![tax_amount, id],
        )?;
        require_found(changed, id)
    }

    pub fn update_tax_period(conn: &Connection, id: i64, tax_period_days: i64) -> Result<()> {
        validate_tax_period(tax_period_days)?;
        let changed = conn.execute(
            "UPDATE owners SET tax_period_days = ?1 WHERE id = ?2",
            params![tax_period_days, id],
        )?;
        require_found(changed, id)
    }

    pub fn set_active(conn: &Connection, id: i64, active: bool) -> Result<()> {
        let changed = conn.execute(
            "UPDATE owners SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        require_found(changed, id)
    }

    /// Record a successful section run on the owner row.
    pub fn stamp_section(
        conn: &Connection,
        id: i64,
        section: UpdateSection,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!("UPDATE owners SET {} = ?1 WHERE id = ?2", section.column());
        let changed = conn.execute(&sql, params![write_ts(now), id])?;
        require_found(changed, id)
    }
}

const SELECT_OWNER: &str = "SELECT id, external_id, kind, name, tax_amount, tax_period_days,
            active, created_at, last_member_sync, last_import, last_rule_run, last_payday
     FROM owners";

fn map_owner(row: &rusqlite::Row<'_>) -> rusqlite::Result<Owner> {
    Ok(Owner {
        id: row.get(0)?,
        external_id: row.get(1)?,
        kind: row.get(2)?,
        name: row.get(3)?,
        tax_amount: row.get(4)?,
        tax_period_days: row.get(5)?,
        active: row.get(6)?,
        created_at: read_ts(row.get(7)?)?,
        last_member_sync: read_opt_ts(row.get(8)?)?,
        last_import: read_opt_ts(row.get(9)?)?,
        last_rule_run: read_opt_ts(row.get(10)?)?,
        last_payday: read_opt_ts(row.get(11)?)?,
    })
}

fn validate_tax_amount(tax_amount: i64) -> Result<()> {
    if tax_amount < 0 {
        return Err(Error::Validation {
            field: "tax amount",
            reason: "must be zero or positive".to_string(),
        });
    }
    Ok(())
}

fn validate_tax_period(tax_period_days: i64) -> Result<()> {
    if tax_period_days < 1 {
        return Err(Error::Validation {
            field: "tax period",
            reason: "must be at least one day".to_string(),
        });
    }
    Ok(())
}

fn require_found(changed: usize, id: i64) -> Result<()> {
    if changed == 0 {
        return Err(Error::NotFound {
            entity: "Owner",
            id,
        });
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::error::ErrorKind;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn register_test_owner(conn: &Connection) -> Owner {
        OwnerRepository::register(
            conn,
            OwnerKind::Corporation,
            98000001,
            "Brave Holding",
            1000,
            30,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let conn = test_conn();
        let owner = register_test_owner(&conn);

        assert_eq!(owner.kind, OwnerKind::Corporation);
        assert_eq!(owner.tax_amount, 1000);
        assert_eq!(owner.tax_period_days, 30);
        assert!(owner.active);
        assert!(owner.last_payday.is_none());

        let fetched = OwnerRepository::get(&conn, owner.id).unwrap();
        assert_eq!(fetched.name, "Brave Holding");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let conn = test_conn();
        register_test_owner(&conn);

        let err = OwnerRepository::register(
            &conn,
            OwnerKind::Corporation,
            98000001,
            "Brave Holding Again",
            500,
            14,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_tax_config_validation() {
        let conn = test_conn();
        let owner = register_test_owner(&conn);

        let err = OwnerRepository::update_tax_amount(&conn, owner.id, -5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = OwnerRepository::update_tax_period(&conn, owner.id, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        OwnerRepository::update_tax_amount(&conn, owner.id, 2500).unwrap();
        OwnerRepository::update_tax_period(&conn, owner.id, 7).unwrap();
        let owner = OwnerRepository::get(&conn, owner.id).unwrap();
        assert_eq!(owner.tax_amount, 2500);
        assert_eq!(owner.tax_period_days, 7);
    }

    #[test]
    fn test_get_by_external_tolerates_unknown() {
        let conn = test_conn();
        register_test_owner(&conn);

        assert!(OwnerRepository::get_by_external(&conn, 98000001)
            .unwrap()
            .is_some());
        assert!(OwnerRepository::get_by_external(&conn, 12345)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stamp_sections() {
        let conn = test_conn();
        let owner = register_test_owner(&conn);
        let now = Utc::now();

        OwnerRepository::stamp_section(&conn, owner.id, UpdateSection::Import, now).unwrap();
        OwnerRepository::stamp_section(&conn, owner.id, UpdateSection::Payday, now).unwrap();

        let owner = OwnerRepository::get(&conn, owner.id).unwrap();
        assert!(owner.last_import.is_some());
        assert!(owner.last_payday.is_some());
        assert!(owner.last_member_sync.is_none());
    }

    #[test]
    fn test_missing_owner_is_not_found() {
        let conn = test_conn();
        let err = OwnerRepository::get(&conn, 999).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
