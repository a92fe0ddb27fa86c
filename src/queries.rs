// Read queries and visibility
//
// The API layer above this crate authenticates callers; this module enforces
// scope again at the data boundary. An actor is whoever asks: a site admin
// (Full), an owner's manager (Owner), or a member looking at their own
// obligation (Person). Managers see an owner's whole book, members see only
// rows tied to their person id.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::entities::{
    AccountRepository, AccountStatus, HistoryRepository, Member, MemberRepository, MemberStatus,
    Owner, OwnerRepository, PayerAccount, Payment, PaymentEntry, PaymentRepository, PaymentStatus,
};
use crate::error::{Error, Result};
use crate::payday;

// ============================================================================
// ACTORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum AccessScope {
    /// Sees and manages every owner.
    Full,
    /// Manages one owner.
    Owner(i64),
    /// Sees their own account and payments only.
    Person(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    pub scope: AccessScope,
}

impl Actor {
    pub fn admin(name: impl Into<String>) -> Self {
        Actor {
            name: name.into(),
            scope: AccessScope::Full,
        }
    }

    pub fn manager(name: impl Into<String>, owner_id: i64) -> Self {
        Actor {
            name: name.into(),
            scope: AccessScope::Owner(owner_id),
        }
    }

    pub fn member(name: impl Into<String>, person_id: i64) -> Self {
        Actor {
            name: name.into(),
            scope: AccessScope::Person(person_id),
        }
    }

    pub fn can_manage(&self, owner_id: i64) -> bool {
        match self.scope {
            AccessScope::Full => true,
            AccessScope::Owner(id) => id == owner_id,
            AccessScope::Person(_) => false,
        }
    }

    pub fn can_view(&self, owner_id: i64) -> bool {
        match self.scope {
            AccessScope::Full => true,
            AccessScope::Owner(id) => id == owner_id,
            AccessScope::Person(_) => true,
        }
    }

    fn person_filter(&self) -> Option<i64> {
        match self.scope {
            AccessScope::Person(person_id) => Some(person_id),
            _ => None,
        }
    }
}

pub fn require_manage(actor: &Actor, owner_id: i64) -> Result<()> {
    if actor.can_manage(owner_id) {
        Ok(())
    } else {
        Err(Error::PermissionDenied {
            actor: actor.name.clone(),
            owner_id,
        })
    }
}

fn require_view(actor: &Actor, owner_id: i64) -> Result<()> {
    if actor.can_view(owner_id) {
        Ok(())
    } else {
        Err(Error::PermissionDenied {
            actor: actor.name.clone(),
            owner_id,
        })
    }
}

// ============================================================================
// READS
// ============================================================================

/// Accounts visible to the actor under one owner.
pub fn list_accounts(conn: &Connection, actor: &Actor, owner_id: i64) -> Result<Vec<PayerAccount>> {
    require_view(actor, owner_id)?;
    let accounts = AccountRepository::list_for_owner(conn, owner_id)?;
    Ok(match actor.person_filter() {
        Some(person_id) => accounts
            .into_iter()
            .filter(|a| a.person_id == person_id)
            .collect(),
        None => accounts,
    })
}

/// Payments visible to the actor under one owner, optionally narrowed by
/// status.
pub fn list_payments(
    conn: &Connection,
    actor: &Actor,
    owner_id: i64,
    status: Option<PaymentStatus>,
) -> Result<Vec<Payment>> {
    require_view(actor, owner_id)?;
    let payments = match status {
        Some(status) => PaymentRepository::list_with_status(conn, owner_id, status)?,
        None => PaymentRepository::list_for_owner(conn, owner_id)?,
    };
    match actor.person_filter() {
        Some(person_id) => {
            let own: std::collections::HashSet<i64> =
                AccountRepository::list_for_owner(conn, owner_id)?
                    .into_iter()
                    .filter(|a| a.person_id == person_id)
                    .map(|a| a.id)
                    .collect();
            Ok(payments
                .into_iter()
                .filter(|p| own.contains(&p.account_id))
                .collect())
        }
        None => Ok(payments),
    }
}

/// Full audit trail of one payment, same visibility as the payment itself.
pub fn payment_trail(
    conn: &Connection,
    actor: &Actor,
    owner_id: i64,
    payment_id: i64,
) -> Result<Vec<PaymentEntry>> {
    require_view(actor, owner_id)?;
    let payment = PaymentRepository::get_for_owner(conn, owner_id, payment_id)?;
    if let Some(person_id) = actor.person_filter() {
        let account = AccountRepository::get(conn, payment.account_id)?;
        if account.person_id != person_id {
            return Err(Error::NotFound {
                entity: "Payment",
                id: payment_id,
            });
        }
    }
    HistoryRepository::payment_trail(conn, payment_id)
}

/// Member roster rows, manager view.
pub fn list_members(conn: &Connection, actor: &Actor, owner_id: i64) -> Result<Vec<Member>> {
    require_manage(actor, owner_id)?;
    MemberRepository::list_for_owner(conn, owner_id)
}

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AccountStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub deactivated: usize,
    pub missing: usize,
    pub paid: usize,
    pub unpaid: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentStats {
    pub total: usize,
    pub pending: usize,
    pub needs_approval: usize,
    pub approved: usize,
    pub rejected: usize,
    pub auto_approved: usize,
    pub human_reviewed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MemberStats {
    pub total: usize,
    pub active: usize,
    pub missing: usize,
    pub alts: usize,
    pub unregistered: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OwnerStatistics {
    pub owner: Owner,
    pub accounts: AccountStats,
    pub payments: PaymentStats,
    pub members: MemberStats,
}

/// Dashboard numbers for one owner. Manager view.
pub fn statistics(conn: &Connection, actor: &Actor, owner_id: i64) -> Result<OwnerStatistics> {
    require_manage(actor, owner_id)?;
    let owner = OwnerRepository::get(conn, owner_id)?;
    let now = chrono::Utc::now();

    let mut accounts = AccountStats::default();
    for account in AccountRepository::list_for_owner(conn, owner_id)? {
        accounts.total += 1;
        match account.status {
            AccountStatus::Active => {
                accounts.active += 1;
                if payday::has_paid(&account, &owner, now) {
                    accounts.paid += 1;
                } else {
                    accounts.unpaid += 1;
                }
            }
            AccountStatus::Inactive => accounts.inactive += 1,
            AccountStatus::Deactivated => accounts.deactivated += 1,
            AccountStatus::Missing => accounts.missing += 1,
        }
    }

    let mut payments = PaymentStats::default();
    let mut stmt = conn.prepare(
        "SELECT status, reviser_kind, COUNT(*) FROM payments
         WHERE owner_id = ?1 GROUP BY status, reviser_kind",
    )?;
    let groups = stmt
        .query_map(params![owner_id], |row| {
            Ok((
                row.get::<_, PaymentStatus>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)? as usize,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (status, reviser_kind, count) in groups {
        payments.total += count;
        match status {
            PaymentStatus::Pending => payments.pending += count,
            PaymentStatus::NeedsApproval => payments.needs_approval += count,
            PaymentStatus::Approved => payments.approved += count,
            PaymentStatus::Rejected => payments.rejected += count,
        }
        match reviser_kind.as_deref() {
            Some("automatic") => payments.auto_approved += count,
            Some("human") => payments.human_reviewed += count,
            _ => {}
        }
    }

    let mut members = MemberStats::default();
    for member in MemberRepository::list_for_owner(conn, owner_id)? {
        members.total += 1;
        match member.status {
            MemberStatus::Active => members.active += 1,
            MemberStatus::Missing => members.missing += 1,
            MemberStatus::Alt => members.alts += 1,
            MemberStatus::Unregistered => members.unregistered += 1,
        }
    }

    Ok(OwnerStatistics {
        owner,
        accounts,
        payments,
        members,
    })
}

// ============================================================================
// TESTS
// ============================================================================
