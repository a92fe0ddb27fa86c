// SQLite storage layer.
//
// Owns the schema, the connection pragmas, the RFC3339 timestamp codecs, and
// the two append-only stores that back ingestion: raw ledger entries and the
// entity-name cache. Everything row-shaped above this layer lives in the
// entity repositories.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::error::Result;

/// Ledger entry type tags eligible for payment matching. Everything else is
/// ingested for the record but never matched.
pub const ELIGIBLE_ENTRY_TYPES: &[&str] = &["player_donation"];

// ============================================================================
// CONNECTION & SCHEMA
// ============================================================================

/// Open (or create) a database file and install the schema.
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    Ok(conn)
}

/// Create all tables and indexes. Safe to call on every startup.
pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery, foreign keys for referential integrity
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Owners
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS owners (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id INTEGER NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            tax_amount INTEGER NOT NULL DEFAULT 0,
            tax_period_days INTEGER NOT NULL DEFAULT 30,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            last_member_sync TEXT,
            last_import TEXT,
            last_rule_run TEXT,
            last_payday TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Payer accounts (one per person per owner)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id INTEGER NOT NULL REFERENCES owners(id),
            person_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            deposit INTEGER NOT NULL DEFAULT 0,
            last_paid TEXT,
            notice TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (owner_id, person_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Member roster records (one per persona)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS members (
            persona_id INTEGER PRIMARY KEY,
            owner_id INTEGER NOT NULL REFERENCES owners(id),
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            joined TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Payments (entry_id NULL = manual; unique per owner when set)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id INTEGER NOT NULL REFERENCES owners(id),
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            entry_id INTEGER,
            payer_name TEXT NOT NULL,
            amount INTEGER NOT NULL,
            date TEXT NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            reviser_kind TEXT,
            reviser_name TEXT,
            UNIQUE (owner_id, entry_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Raw ledger entries (append-only, keyed by owner + external id)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            owner_id INTEGER NOT NULL REFERENCES owners(id),
            entry_id INTEGER NOT NULL,
            first_party_id INTEGER NOT NULL,
            second_party_id INTEGER NOT NULL,
            amount INTEGER NOT NULL,
            date TEXT NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            entry_type TEXT NOT NULL,
            PRIMARY KEY (owner_id, entry_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Entity-name cache (write-through, no expiry)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entity_names (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Rule groups and rules
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS filter_sets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id INTEGER NOT NULL REFERENCES owners(id),
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            UNIQUE (owner_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS filters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filter_set_id INTEGER NOT NULL REFERENCES filter_sets(id),
            criterion TEXT NOT NULL,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Audit trails (append-only)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS payment_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            payment_id INTEGER NOT NULL REFERENCES payments(id),
            owner_id INTEGER NOT NULL,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            new_status TEXT NOT NULL,
            comment TEXT NOT NULL DEFAULT '',
            details TEXT,
            date TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS admin_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            owner_id INTEGER NOT NULL,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            comment TEXT NOT NULL DEFAULT '',
            date TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_accounts_person ON accounts(person_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_members_owner ON members(owner_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_owner_status ON payments(owner_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_account ON payments(account_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ledger_owner_type ON ledger_entries(owner_id, entry_type)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payment_history_payment ON payment_history(payment_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_admin_history_owner ON admin_history(owner_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// TIMESTAMP CODECS
// ============================================================================
// Timestamps are stored as RFC3339 TEXT. The read helpers produce
// rusqlite-compatible errors so they compose inside `query_map` closures.

pub(crate) fn write_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

pub(crate) fn write_opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(write_ts)
}

pub(crate) fn read_ts(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn read_opt_ts(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(read_ts).transpose()
}

// ============================================================================
// RAW LEDGER ENTRIES
// ============================================================================

/// One raw financial record from the external ledger feed. Immutable once
/// ingested; the owner scope is supplied at insert time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: i64,
    pub first_party_id: i64,
    pub second_party_id: i64,
    pub amount: i64,
    pub date: DateTime<Utc>,
    pub reason: String,
    pub entry_type: String,
}

impl LedgerEntry {
    pub fn is_eligible(&self) -> bool {
        ELIGIBLE_ENTRY_TYPES.contains(&self.entry_type.as_str())
    }
}

/// Outcome of one ingestion batch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IngestStats {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Ingest a page of raw ledger entries for an owner. Re-ingesting the same
/// entry is a counted no-op via the (owner_id, entry_id) primary key.
pub fn insert_ledger_entries(
    conn: &Connection,
    owner_id: i64,
    entries: &[LedgerEntry],
) -> Result<IngestStats> {
    let mut stats = IngestStats::default();

    for entry in entries {
        let result = conn.execute(
            "INSERT INTO ledger_entries (
                owner_id, entry_id, first_party_id, second_party_id,
                amount, date, reason, entry_type
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                owner_id,
                entry.entry_id,
                entry.first_party_id,
                entry.second_party_id,
                entry.amount,
                write_ts(entry.date),
                entry.reason,
                entry.entry_type,
            ],
        );

        match result {
            Ok(_) => stats.inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                stats.duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    debug!(
        owner_id,
        inserted = stats.inserted,
        duplicates = stats.duplicates,
        "ledger entries ingested"
    );

    Ok(stats)
}

/// Stored entries eligible for payment matching, newest first.
pub fn eligible_entries(conn: &Connection, owner_id: i64) -> Result<Vec<LedgerEntry>> {
    let placeholders = ELIGIBLE_ENTRY_TYPES
        .iter()
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT entry_id, first_party_id, second_party_id, amount, date, reason, entry_type
         FROM ledger_entries
         WHERE owner_id = ? AND entry_type IN ({})
         ORDER BY date DESC, entry_id DESC",
        placeholders
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut bindings: Vec<&dyn rusqlite::ToSql> = vec![&owner_id];
    for tag in ELIGIBLE_ENTRY_TYPES {
        bindings.push(tag);
    }

    let entries = stmt
        .query_map(&bindings[..], |row| {
            let date: String = row.get(4)?;
            Ok(LedgerEntry {
                entry_id: row.get(0)?,
                first_party_id: row.get(1)?,
                second_party_id: row.get(2)?,
                amount: row.get(3)?,
                date: read_ts(date)?,
                reason: row.get(5)?,
                entry_type: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(entries)
}

pub fn ledger_entry_count(conn: &Connection, owner_id: i64) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM ledger_entries WHERE owner_id = ?1",
        params![owner_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ============================================================================
// ENTITY-NAME CACHE
// ============================================================================

/// Names already cached for the given ids. Ids with no cached name are simply
/// absent from the map.
pub fn cached_entity_names(conn: &Connection, ids: &[i64]) -> Result<HashMap<i64, String>> {
    let mut names = HashMap::new();
    if ids.is_empty() {
        return Ok(names);
    }

    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT id, name FROM entity_names WHERE id IN ({})",
        placeholders
    );

    let mut stmt = conn.prepare(&sql)?;
    let bindings: Vec<&dyn rusqlite::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();

    let rows = stmt.query_map(&bindings[..], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    for row in rows {
        let (id, name) = row?;
        names.insert(id, name);
    }

    Ok(names)
}

/// Persist newly learned id -> name mappings. First write wins; re-learning
/// an id is a no-op.
pub fn store_entity_names(conn: &Connection, names: &HashMap<i64, String>) -> Result<usize> {
    let mut stored = 0;
    for (id, name) in names {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO entity_names (id, name) VALUES (?1, ?2)",
            params![id, name],
        )?;
        stored += changed;
    }
    Ok(stored)
}

// ============================================================================
// TESTS
// ============================================================================
