// Payer account - one person's obligation record under exactly one owner
//
// The deposit is a plain signed integer and may go negative (dues owed).
// Lifecycle changes (missing, relocation, reactivation) are driven by the
// account directory; manual activate/deactivate is an admin action.

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
pub enum AccountStatus {
    /// Billed by payday and counted in statistics.
    Active,
    /// Person is no longer registered with the auth system.
    Inactive,
    /// Turned off by an administrator; sticky across syncs.
    Deactivated,
    /// Person left the organization; waiting to be relocated or reactivated.
    Missing,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
            AccountStatus::Deactivated => "deactivated",
            AccountStatus::Missing => "missing",
        }
    }

    pub fn parse(s: &str) -> Option<AccountStatus> {
        match s {
            "active" => Some(AccountStatus::Active),
            "inactive" => Some(AccountStatus::Inactive),
            "deactivated" => Some(AccountStatus::Deactivated),
            "missing" => Some(AccountStatus::Missing),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for AccountStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for AccountStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        AccountStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown account status '{}'", s).into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayerAccount {
    pub id: i64,
    pub owner_id: i64,
    /// The person behind the account, not any single persona.
    pub person_id: i64,
    /// Display name, taken from the person's main persona.
    pub name: String,
    pub status: AccountStatus,
    pub deposit: i64,
    /// None = never billed; the first period is free.
    pub last_paid: Option<DateTime<Utc>>,
    pub notice: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PayerAccount {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

pub struct AccountRepository;

impl AccountRepository {
    pub fn create(
        conn: &Connection,
        owner_id: i64,
        person_id: i64,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<PayerAccount> {
        let result = conn.execute(
            "INSERT INTO accounts (owner_id, person_id, name, status, deposit, created_at)
             VALUES (?1, ?2, ?3, 'active', 0, ?4)",
            params![owner_id, person_id, name, write_ts(now)],
        );

        match result {
            Ok(_) => Self::get(conn, conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists {
                    entity: "Payer account",
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(conn: &Connection, id: i64) -> Result<PayerAccount> {
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_ACCOUNT),
            params![id],
            map_account,
        )
        .optional()?
        .ok_or(Error::NotFound {
            entity: "Payer account",
            id,
        })
    }

    /// The person's account under any owner, if one exists. The directory
    /// keeps at most one alive, so a single row answer is enough.
    pub fn get_for_person(conn: &Connection, person_id: i64) -> Result<Option<PayerAccount>> {
        let account = conn
            .query_row(
                &format!("{} WHERE person_id = ?1 ORDER BY id LIMIT 1", SELECT_ACCOUNT),
                params![person_id],
                map_account,
            )
            .optional()?;
        Ok(account)
    }

    pub fn list_for_owner(conn: &Connection, owner_id: i64) -> Result<Vec<PayerAccount>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE owner_id = ?1 ORDER BY name",
            SELECT_ACCOUNT
        ))?;
        let accounts = stmt
            .query_map(params![owner_id], map_account)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    pub fn list_with_status(
        conn: &Connection,
        owner_id: i64,
        status: AccountStatus,
    ) -> Result<Vec<PayerAccount>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE owner_id = ?1 AND status = ?2 ORDER BY id",
            SELECT_ACCOUNT
        ))?;
        let accounts = stmt
            .query_map(params![owner_id, status], map_account)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    pub fn set_status(conn: &Connection, id: i64, status: AccountStatus) -> Result<()> {
        let changed = conn.execute(
            "UPDATE accounts SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        require_found(changed, id)
    }

    pub fn set_notice(conn: &Connection, id: i64, notice: Option<&str>) -> Result<()> {
        let changed = conn.execute(
            "UPDATE accounts SET notice = ?1 WHERE id = ?2",
            params![notice, id],
        )?;
        require_found(changed, id)
    }

    /// deposit += amount. Negative amounts are legal (reversals).
    pub fn credit(conn: &Connection, id: i64, amount: i64) -> Result<()> {
        let changed = conn.execute(
            "UPDATE accounts SET deposit = deposit + ?1 WHERE id = ?2",
            params![amount, id],
        )?;
        require_found(changed, id)
    }

    /// deposit -= amount.
    pub fn debit(conn: &Connection, id: i64, amount: i64) -> Result<()> {
        Self::credit(conn, id, -amount)
    }

    /// One-statement payday charge: debit and stamp last_paid together so a
    /// crash cannot separate them.
    pub fn debit_and_stamp(
        conn: &Connection,
        id: i64,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let changed = conn.execute(
            "UPDATE accounts SET deposit = deposit - ?1, last_paid = ?2 WHERE id = ?3",
            params![amount, write_ts(now), id],
        )?;
        require_found(changed, id)
    }

    pub fn set_last_paid(
        conn: &Connection,
        id: i64,
        last_paid: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let changed = conn.execute(
            "UPDATE accounts SET last_paid = ?1 WHERE id = ?2",
            params![last_paid.map(write_ts), id],
        )?;
        require_found(changed, id)
    }

    /// Move a missing account to the owner the person now belongs to.
    /// Balance and billing anchor start over under the new owner.
    pub fn relocate(conn: &Connection, id: i64, new_owner_id: i64) -> Result<()> {
        let result = conn.execute(
            "UPDATE accounts
             SET owner_id = ?1, deposit = 0, last_paid = NULL, status = 'active'
             WHERE id = ?2",
            params![new_owner_id, id],
        );

        match result {
            Ok(changed) => require_found(changed, id),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists {
                    entity: "Payer account",
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reactivate a missing account whose person returned to this owner.
    pub fn reactivate(conn: &Connection, id: i64) -> Result<()> {
        let changed = conn.execute(
            "UPDATE accounts
             SET status = 'active', deposit = 0, last_paid = NULL, notice = NULL
             WHERE id = ?1",
            params![id],
        )?;
        require_found(changed, id)
    }
}

const SELECT_ACCOUNT: &str =
    "SELECT id, owner_id, person_id, name, status, deposit, last_paid, notice, created_at
     FROM accounts";

fn map_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<PayerAccount> {
    Ok(PayerAccount {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        person_id: row.get(2)?,
        name: row.get(3)?,
        status: row.get(4)?,
        deposit: row.get(5)?,
        last_paid: read_opt_ts(row.get(6)?)?,
        notice: row.get(7)?,
        created_at: read_ts(row.get(8)?)?,
    })
}

fn require_found(changed: usize, id: i64) -> Result<()> {
    if changed == 0 {
        return Err(Error::NotFound {
            entity: "Payer account",
            id,
        });
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
