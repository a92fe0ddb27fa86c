// Identity resolver
//
// Cache-first name resolution for external ids. Ids already in entity_names
// are served locally; the rest go upstream in a single batch, and fresh
// names are written back. A dead identity service degrades to placeholder
// names instead of failing the caller, so imports and syncs keep working.

use rusqlite::Connection;
use std::collections::HashMap;
use tracing::warn;

use crate::db;
use crate::error::Result;
use crate::providers::IdentityLookup;

/// Name used when an id cannot be resolved. Never cached, so a later run
/// with a healthy lookup can still fill the real name in.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Resolve every id to a display name. The returned map always contains an
/// entry for every requested id.
pub fn resolve(
    conn: &Connection,
    lookup: &dyn IdentityLookup,
    ids: &[i64],
) -> Result<HashMap<i64, String>> {
    let mut unique: Vec<i64> = ids.to_vec();
    unique.sort_unstable();
    unique.dedup();

    let mut names = db::cached_entity_names(conn, &unique)?;

    let misses: Vec<i64> = unique
        .iter()
        .copied()
        .filter(|id| !names.contains_key(id))
        .collect();

    if !misses.is_empty() {
        match lookup.lookup_names(&misses) {
            Ok(fresh) => {
                db::store_entity_names(conn, &fresh)?;
                names.extend(fresh);
            }
            Err(e) => {
                warn!(misses = misses.len(), error = %e, "identity lookup failed, using placeholders");
            }
        }
    }

    for id in &unique {
        names
            .entry(*id)
            .or_insert_with(|| UNKNOWN_NAME.to_string());
    }

    Ok(names)
}

/// Resolve a single id.
pub fn resolve_one(conn: &Connection, lookup: &dyn IdentityLookup, id: i64) -> Result<String> {
    let mut names = resolve(conn, lookup, &[id])?;
    Ok(names.remove(&id).unwrap_or_else(|| UNKNOWN_NAME.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================
