// Member roster records
//
// One row per persona seen on an owner's roster. Rows are never deleted;
// personas that drop off the roster are flagged instead, so the directory
// sync can tell a brief absence from a real departure.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ToSql};
use serde::{Deserialize, Serialize};

use crate::db::{read_opt_ts, write_opt_ts};
use crate::error::Result;

// ============================================================================
// MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// On the roster and tied to a registered person's main persona.
    Active,
    /// No longer on the roster.
    Missing,
    /// On the roster as a secondary persona of a registered person.
    Alt,
    /// On the roster but its person is unknown to the persona provider.
    Unregistered,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Active => "active",
            MemberStatus::Missing => "missing",
            MemberStatus::Alt => "alt",
            MemberStatus::Unregistered => "unregistered",
        }
    }

    pub fn parse(s: &str) -> Option<MemberStatus> {
        match s {
            "active" => Some(MemberStatus::Active),
            "missing" => Some(MemberStatus::Missing),
            "alt" => Some(MemberStatus::Alt),
            "unregistered" => Some(MemberStatus::Unregistered),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for MemberStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for MemberStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        MemberStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown member status '{}'", s).into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub persona_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub status: MemberStatus,
    pub joined: Option<DateTime<Utc>>,
}

// ============================================================================
// REPOSITORY
// ============================================================================

pub struct MemberRepository;

impl MemberRepository {
    /// Insert or refresh a roster row. A persona moving between owners keeps
    /// a single row; the latest roster wins on owner, name and join date, and
    /// presence on any roster puts the row back to active.
    pub fn upsert(
        conn: &Connection,
        owner_id: i64,
        persona_id: i64,
        name: &str,
        joined: Option<DateTime<Utc>>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO members (persona_id, owner_id, name, status, joined)
             VALUES (?1, ?2, ?3, 'active', ?4)
             ON CONFLICT(persona_id) DO UPDATE SET
                owner_id = excluded.owner_id,
                name = excluded.name,
                status = 'active',
                joined = excluded.joined",
            params![persona_id, owner_id, name, write_opt_ts(joined)],
        )?;
        Ok(())
    }

    pub fn list_for_owner(conn: &Connection, owner_id: i64) -> Result<Vec<Member>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE owner_id = ?1 ORDER BY name",
            SELECT_MEMBER
        ))?;
        let members = stmt
            .query_map(params![owner_id], map_member)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(members)
    }

    /// Flag every member of the owner whose persona is not in the present
    /// set. Returns how many rows were flagged.
    pub fn mark_missing(conn: &Connection, owner_id: i64, present: &[i64]) -> Result<usize> {
        if present.is_empty() {
            let changed = conn.execute(
                "UPDATE members SET status = 'missing'
                 WHERE owner_id = ?1 AND status != 'missing'",
                params![owner_id],
            )?;
            return Ok(changed);
        }

        let placeholders = present
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE members SET status = 'missing'
             WHERE owner_id = ?1 AND status != 'missing' AND persona_id NOT IN ({})",
            placeholders
        );

        let mut bindings: Vec<&dyn ToSql> = Vec::with_capacity(present.len() + 1);
        bindings.push(&owner_id);
        for id in present {
            bindings.push(id);
        }

        let changed = conn.execute(&sql, bindings.as_slice())?;
        Ok(changed)
    }

    pub fn set_status(conn: &Connection, persona_id: i64, status: MemberStatus) -> Result<()> {
        conn.execute(
            "UPDATE members SET status = ?1 WHERE persona_id = ?2",
            params![status, persona_id],
        )?;
        Ok(())
    }
}

const SELECT_MEMBER: &str =
    "SELECT persona_id, owner_id, name, status, joined FROM members";

fn map_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<Member> {
    Ok(Member {
        persona_id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        joined: read_opt_ts(row.get(4)?)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::entities::owner::{OwnerKind, OwnerRepository};

    fn test_conn() -> (Connection, i64) {
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
        (conn, owner.id)
    }

    #[test]
    fn test_upsert_inserts_then_refreshes() {
        let (conn, owner_id) = test_conn();

        MemberRepository::upsert(&conn, owner_id, 501, "Orren Kalda", None).unwrap();
        MemberRepository::set_status(&conn, 501, MemberStatus::Missing).unwrap();

        // Reappearing on the roster reactivates and refreshes the name.
        MemberRepository::upsert(&conn, owner_id, 501, "Orren Kalda II", None).unwrap();

        let members = MemberRepository::list_for_owner(&conn, owner_id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "Orren Kalda II");
        assert_eq!(members[0].status, MemberStatus::Active);
    }

    #[test]
    fn test_upsert_moves_between_owners() {
        let (conn, owner_id) = test_conn();
        let other = OwnerRepository::register(
            &conn,
            OwnerKind::Corporation,
            98000002,
            "Second Corp",
            500,
            30,
            Utc::now(),
        )
        .unwrap();

        MemberRepository::upsert(&conn, owner_id, 501, "Orren Kalda", None).unwrap();
        MemberRepository::upsert(&conn, other.id, 501, "Orren Kalda", None).unwrap();

        assert!(MemberRepository::list_for_owner(&conn, owner_id).unwrap().is_empty());
        assert_eq!(MemberRepository::list_for_owner(&conn, other.id).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_missing_spares_present() {
        let (conn, owner_id) = test_conn();

        MemberRepository::upsert(&conn, owner_id, 501, "Orren Kalda", None).unwrap();
        MemberRepository::upsert(&conn, owner_id, 502, "Vex Harlan", None).unwrap();
        MemberRepository::upsert(&conn, owner_id, 503, "Mira Senn", None).unwrap();

        let flagged = MemberRepository::mark_missing(&conn, owner_id, &[501, 503]).unwrap();
        assert_eq!(flagged, 1);

        let members = MemberRepository::list_for_owner(&conn, owner_id).unwrap();
        let missing: Vec<_> = members
            .iter()
            .filter(|m| m.status == MemberStatus::Missing)
            .collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].persona_id, 502);
    }

    #[test]
    fn test_mark_missing_with_empty_roster() {
        let (conn, owner_id) = test_conn();

        MemberRepository::upsert(&conn, owner_id, 501, "Orren Kalda", None).unwrap();
        MemberRepository::upsert(&conn, owner_id, 502, "Vex Harlan", None).unwrap();

        let flagged = MemberRepository::mark_missing(&conn, owner_id, &[]).unwrap();
        assert_eq!(flagged, 2);
    }
}
