// Rule engine
//
// Rules as data: a filter set is a named group of predicates owned by one
// owner. A pending payment that satisfies every predicate of an enabled set
// is approved automatically with the engine as reviser; everything left over
// goes to manual review. Sets are evaluated in definition order and the
// first match wins, so a payment is never credited twice in one pass.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{read_ts, write_ts};
use crate::entities::{
    HistoryRepository, Owner, OwnerRepository, Payment, PaymentAction, PaymentRepository,
    PaymentStatus, Reviser,
};
use crate::error::{Error, Result};
use crate::payments;

// ============================================================================
// CRITERIA
// ============================================================================

/// One predicate over a payment. Matching is case-insensitive for text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "criterion", content = "value", rename_all = "snake_case")]
pub enum Criterion {
    /// amount >= threshold
    AmountAtLeast(i64),
    /// reason contains the substring
    ReasonContains(String),
}

impl Criterion {
    pub fn matches(&self, payment: &Payment) -> bool {
        match self {
            Criterion::AmountAtLeast(min) => payment.amount >= *min,
            Criterion::ReasonContains(needle) => payment
                .reason
                .to_lowercase()
                .contains(&needle.to_lowercase()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Criterion::AmountAtLeast(min) => format!("amount >= {}", min),
            Criterion::ReasonContains(needle) => format!("reason contains '{}'", needle),
        }
    }

    fn kind_str(&self) -> &'static str {
        match self {
            Criterion::AmountAtLeast(_) => "amount_at_least",
            Criterion::ReasonContains(_) => "reason_contains",
        }
    }

    fn value_string(&self) -> String {
        match self {
            Criterion::AmountAtLeast(min) => min.to_string(),
            Criterion::ReasonContains(needle) => needle.clone(),
        }
    }

    fn from_columns(kind: &str, value: &str) -> rusqlite::Result<Criterion> {
        match kind {
            "amount_at_least" => {
                let min = value.parse::<i64>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                Ok(Criterion::AmountAtLeast(min))
            }
            "reason_contains" => Ok(Criterion::ReasonContains(value.to_string())),
            other => Err(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown criterion '{}'", other).into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub id: i64,
    pub filter_set_id: i64,
    pub criterion: Criterion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSet {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub filters: Vec<Filter>,
}

impl FilterSet {
    /// All predicates must hold. A set with no predicates matches every
    /// payment.
    pub fn matches(&self, payment: &Payment) -> bool {
        self.filters.iter().all(|f| f.criterion.matches(payment))
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

pub struct FilterSetRepository;

impl FilterSetRepository {
    pub fn create(
        conn: &Connection,
        owner_id: i64,
        name: &str,
        description: &str,
    ) -> Result<FilterSet> {
        if name.trim().is_empty() {
            return Err(Error::Validation {
                field: "name",
                reason: "must not be empty".to_string(),
            });
        }

        let result = conn.execute(
            "INSERT INTO filter_sets (owner_id, name, description, enabled, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![owner_id, name, description, write_ts(Utc::now())],
        );
        match result {
            Ok(_) => Self::get(conn, conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists {
                    entity: "Filter set",
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(conn: &Connection, id: i64) -> Result<FilterSet> {
        let set = conn
            .query_row(
                "SELECT id, owner_id, name, description, enabled, created_at
                 FROM filter_sets WHERE id = ?1",
                params![id],
                map_filter_set,
            )
            .optional()?
            .ok_or(Error::NotFound {
                entity: "Filter set",
                id,
            })?;
        Self::load_filters(conn, set)
    }

    pub fn get_for_owner(conn: &Connection, owner_id: i64, id: i64) -> Result<FilterSet> {
        let set = Self::get(conn, id)?;
        if set.owner_id != owner_id {
            return Err(Error::NotFound {
                entity: "Filter set",
                id,
            });
        }
        Ok(set)
    }

    /// Sets in definition order, predicates loaded.
    pub fn list_for_owner(conn: &Connection, owner_id: i64) -> Result<Vec<FilterSet>> {
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, name, description, enabled, created_at
             FROM filter_sets WHERE owner_id = ?1 ORDER BY id",
        )?;
        let sets = stmt
            .query_map(params![owner_id], map_filter_set)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        sets.into_iter()
            .map(|set| Self::load_filters(conn, set))
            .collect()
    }

    pub fn add_filter(conn: &Connection, filter_set_id: i64, criterion: &Criterion) -> Result<Filter> {
        conn.execute(
            "INSERT INTO filters (filter_set_id, criterion, value) VALUES (?1, ?2, ?3)",
            params![filter_set_id, criterion.kind_str(), criterion.value_string()],
        )?;
        Ok(Filter {
            id: conn.last_insert_rowid(),
            filter_set_id,
            criterion: criterion.clone(),
        })
    }

    pub fn remove_filter(conn: &Connection, filter_id: i64) -> Result<()> {
        let changed = conn.execute("DELETE FROM filters WHERE id = ?1", params![filter_id])?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "Filter",
                id: filter_id,
            });
        }
        Ok(())
    }

    pub fn set_enabled(conn: &Connection, id: i64, enabled: bool) -> Result<()> {
        let changed = conn.execute(
            "UPDATE filter_sets SET enabled = ?1 WHERE id = ?2",
            params![enabled, id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "Filter set",
                id,
            });
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM filters WHERE filter_set_id = ?1", params![id])?;
        let changed = conn.execute("DELETE FROM filter_sets WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "Filter set",
                id,
            });
        }
        Ok(())
    }

    fn load_filters(conn: &Connection, mut set: FilterSet) -> Result<FilterSet> {
        let mut stmt = conn.prepare(
            "SELECT id, filter_set_id, criterion, value FROM filters
             WHERE filter_set_id = ?1 ORDER BY id",
        )?;
        set.filters = stmt
            .query_map(params![set.id], |row| {
                let kind: String = row.get(2)?;
                let value: String = row.get(3)?;
                Ok(Filter {
                    id: row.get(0)?,
                    filter_set_id: row.get(1)?,
                    criterion: Criterion::from_columns(&kind, &value)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(set)
    }
}

fn map_filter_set(row: &rusqlite::Row<'_>) -> rusqlite::Result<FilterSet> {
    Ok(FilterSet {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        enabled: row.get(4)?,
        created_at: read_ts(row.get(5)?)?,
        filters: Vec::new(),
    })
}

// ============================================================================
// EVALUATION
// ============================================================================

/// Counters for one rule pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuleOutcome {
    pub evaluated: usize,
    pub auto_approved: usize,
    pub needs_approval: usize,
}

impl RuleOutcome {
    pub fn summary(&self) -> String {
        format!(
            "{} evaluated, {} auto-approved, {} to manual review",
            self.evaluated, self.auto_approved, self.needs_approval
        )
    }
}

/// Classify every pending payment of the owner in one pass.
pub fn run(conn: &mut Connection, owner_id: i64) -> Result<RuleOutcome> {
    let owner = OwnerRepository::get(conn, owner_id)?;

    let tx = conn.transaction()?;
    let outcome = run_in(&tx, &owner)?;
    tx.commit()?;

    info!(owner = %owner.name, "rules: {}", outcome.summary());
    Ok(outcome)
}

fn run_in(tx: &Transaction<'_>, owner: &Owner) -> Result<RuleOutcome> {
    let sets: Vec<FilterSet> = FilterSetRepository::list_for_owner(tx, owner.id)?
        .into_iter()
        .filter(|s| s.enabled)
        .collect();

    let pending = PaymentRepository::list_with_status(tx, owner.id, PaymentStatus::Pending)?;
    let mut outcome = RuleOutcome {
        evaluated: pending.len(),
        ..RuleOutcome::default()
    };

    for payment in &pending {
        match sets.iter().find(|set| set.matches(payment)) {
            Some(set) => {
                payments::approve(
                    tx,
                    owner.id,
                    payment.id,
                    &Reviser::Automatic,
                    &format!("Auto-approved by rule set '{}'.", set.name),
                )?;
                outcome.auto_approved += 1;
            }
            None => {
                PaymentRepository::set_status(
                    tx,
                    payment.id,
                    PaymentStatus::NeedsApproval,
                    &None,
                )?;
                HistoryRepository::log_payment(
                    tx,
                    owner.id,
                    payment.id,
                    "System",
                    PaymentAction::StatusChange,
                    PaymentStatus::NeedsApproval,
                    "No rule matched, routed to manual review.",
                    None,
                )?;
                outcome.needs_approval += 1;
            }
        }
    }

    Ok(outcome)
}

// ============================================================================
// TESTS
// ============================================================================
