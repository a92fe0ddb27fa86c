// Account directory
//
// Keeps payer accounts and member rows in step with the organization. Each
// sync runs two passes inside one transaction: an affiliation pass that
// follows registered people (missing, relocation, reactivation) and a roster
// pass that follows the member list (creation, active/inactive flips, alt
// and unregistered flags). All provider fetches and name lookups happen
// before the transaction opens, so no network I/O runs mid-write.
//
// A person controls several personas but holds one payer account; every
// status decision here is made per person and applied to that one account.

use chrono::Utc;
use rusqlite::{Connection, Transaction};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::entities::{
    AccountRepository, AccountStatus, MemberRepository, MemberStatus, Owner, OwnerRepository,
};
use crate::error::{Error, Result};
use crate::providers::{
    IdentityLookup, PersonRecord, PersonaSetProvider, RosterMember, RosterProvider,
};
use crate::resolver;

// ============================================================================
// OUTCOME
// ============================================================================

/// Counters for one sync run, for logs and the CLI.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub members_seen: usize,
    pub members_missing: usize,
    pub members_alts: usize,
    pub members_unregistered: usize,
    pub accounts_created: usize,
    pub accounts_marked_missing: usize,
    pub accounts_relocated: usize,
    pub accounts_reactivated: usize,
    pub accounts_set_active: usize,
    pub accounts_set_inactive: usize,
}

impl SyncOutcome {
    pub fn summary(&self) -> String {
        format!(
            "{} members ({} missing, {} alts, {} unregistered); accounts: {} created, {} marked missing, {} relocated, {} reactivated, {} activated, {} set inactive",
            self.members_seen,
            self.members_missing,
            self.members_alts,
            self.members_unregistered,
            self.accounts_created,
            self.accounts_marked_missing,
            self.accounts_relocated,
            self.accounts_reactivated,
            self.accounts_set_active,
            self.accounts_set_inactive,
        )
    }
}

// ============================================================================
// SYNC
// ============================================================================

/// Refresh one owner's directory from the live roster and person map.
pub fn sync(
    conn: &mut Connection,
    owner_id: i64,
    roster_provider: &dyn RosterProvider,
    people_provider: &dyn PersonaSetProvider,
    lookup: &dyn IdentityLookup,
) -> Result<SyncOutcome> {
    let owner = OwnerRepository::get(conn, owner_id)?;

    let mut roster = roster_provider.fetch_roster()?;
    let mut people = people_provider.fetch_people()?;

    fill_blank_names(conn, lookup, &mut roster, &mut people)?;

    let tx = conn.transaction()?;
    let outcome = apply(&tx, &owner, &roster, &people)?;
    tx.commit()?;

    info!(owner = %owner.name, "directory sync: {}", outcome.summary());
    Ok(outcome)
}

/// Upstream sometimes hands back blank names. Resolve them in one batch so
/// member rows and new accounts never carry empty labels.
fn fill_blank_names(
    conn: &Connection,
    lookup: &dyn IdentityLookup,
    roster: &mut [RosterMember],
    people: &mut [PersonRecord],
) -> Result<()> {
    let mut wanted: Vec<i64> = roster
        .iter()
        .filter(|m| m.name.trim().is_empty())
        .map(|m| m.persona_id)
        .collect();
    wanted.extend(
        people
            .iter()
            .filter(|p| p.main_name.trim().is_empty())
            .map(|p| p.main_persona_id),
    );

    if wanted.is_empty() {
        return Ok(());
    }

    let names = resolver::resolve(conn, lookup, &wanted)?;
    for member in roster.iter_mut() {
        if member.name.trim().is_empty() {
            if let Some(name) = names.get(&member.persona_id) {
                member.name = name.clone();
            }
        }
    }
    for person in people.iter_mut() {
        if person.main_name.trim().is_empty() {
            if let Some(name) = names.get(&person.main_persona_id) {
                person.main_name = name.clone();
            }
        }
    }
    Ok(())
}

fn apply(
    tx: &Transaction<'_>,
    owner: &Owner,
    roster: &[RosterMember],
    people: &[PersonRecord],
) -> Result<SyncOutcome> {
    let mut outcome = SyncOutcome::default();
    let now = Utc::now();

    let roster_ids: HashSet<i64> = roster.iter().map(|m| m.persona_id).collect();
    let person_by_id: HashMap<i64, &PersonRecord> =
        people.iter().map(|p| (p.person_id, p)).collect();

    // ------------------------------------------------------------------
    // Affiliation pass over this owner's accounts. Leaving the org marks
    // the account missing; a missing account follows the person to their
    // new org once that org is registered, or reactivates in place when
    // they come back. Relocation and reactivation reset the obligation
    // (deposit 0, never billed).
    // ------------------------------------------------------------------
    for account in AccountRepository::list_for_owner(tx, owner.id)? {
        let Some(person) = person_by_id.get(&account.person_id) else {
            // Person dropped their registration entirely. Nothing to track
            // against anymore, but the balance stays for bookkeeping.
            if account.status != AccountStatus::Inactive {
                AccountRepository::set_status(tx, account.id, AccountStatus::Inactive)?;
                outcome.accounts_set_inactive += 1;
                debug!(account = %account.name, "person unregistered, account set inactive");
            }
            continue;
        };

        let here = person.organization_id == Some(owner.external_id);

        if account.status != AccountStatus::Missing && !here {
            AccountRepository::set_status(tx, account.id, AccountStatus::Missing)?;
            outcome.accounts_marked_missing += 1;
            info!(account = %account.name, "person left the organization, account marked missing");
        } else if account.status == AccountStatus::Missing && !here {
            let Some(org) = person.organization_id else {
                continue;
            };
            let Some(target) = OwnerRepository::get_by_external(tx, org)? else {
                // New org is not registered here. The account waits.
                continue;
            };
            match AccountRepository::relocate(tx, account.id, target.id) {
                Ok(()) => {
                    outcome.accounts_relocated += 1;
                    info!(account = %account.name, to = %target.name, "account relocated");
                }
                Err(Error::AlreadyExists { .. }) => {
                    warn!(
                        account = %account.name,
                        to = %target.name,
                        "target owner already holds an account for this person, leaving missing"
                    );
                }
                Err(e) => return Err(e),
            }
        } else if account.status == AccountStatus::Missing && here {
            AccountRepository::reactivate(tx, account.id)?;
            outcome.accounts_reactivated += 1;
            info!(account = %account.name, "person back in the organization, account reactivated");
        }
    }

    // ------------------------------------------------------------------
    // Member rows. Everyone on the roster is upserted active, everyone
    // who vanished is flagged missing, then personas are classified
    // against the person map.
    // ------------------------------------------------------------------
    for member in roster {
        MemberRepository::upsert(tx, owner.id, member.persona_id, &member.name, member.joined)?;
    }
    outcome.members_seen = roster.len();

    let present: Vec<i64> = roster.iter().map(|m| m.persona_id).collect();
    outcome.members_missing = MemberRepository::mark_missing(tx, owner.id, &present)?;

    let mut unclaimed: HashSet<i64> = roster_ids.clone();
    for person in people {
        if person.organization_id != Some(owner.external_id) {
            continue;
        }
        for persona in &person.personas {
            if roster_ids.contains(persona) {
                unclaimed.remove(persona);
                if *persona != person.main_persona_id {
                    MemberRepository::set_status(tx, *persona, MemberStatus::Alt)?;
                    outcome.members_alts += 1;
                }
            }
        }
    }
    for persona in &unclaimed {
        MemberRepository::set_status(tx, *persona, MemberStatus::Unregistered)?;
    }
    outcome.members_unregistered = unclaimed.len();

    // ------------------------------------------------------------------
    // Roster pass over registered people whose main sits in this org.
    // One payer account per person: create it on first sight, flip it
    // active/inactive with roster presence. Deactivated stays put until
    // an administrator turns it back on.
    // ------------------------------------------------------------------
    for person in people {
        if person.organization_id != Some(owner.external_id) {
            continue;
        }

        let on_roster = person.personas.iter().any(|p| roster_ids.contains(p));
        let existing = AccountRepository::get_for_person(tx, person.person_id)?;

        if on_roster {
            match existing {
                None => {
                    let name = display_name(person, roster);
                    AccountRepository::create(tx, owner.id, person.person_id, &name, now)?;
                    outcome.accounts_created += 1;
                    info!(person = person.person_id, name = %name, "payer account created");
                }
                Some(account)
                    if account.owner_id == owner.id
                        && account.status == AccountStatus::Inactive =>
                {
                    AccountRepository::set_status(tx, account.id, AccountStatus::Active)?;
                    outcome.accounts_set_active += 1;
                }
                Some(_) => {}
            }
        } else if let Some(account) = existing {
            if account.owner_id == owner.id && account.status == AccountStatus::Active {
                AccountRepository::set_status(tx, account.id, AccountStatus::Inactive)?;
                outcome.accounts_set_inactive += 1;
                debug!(account = %account.name, "no persona on roster, account set inactive");
            }
        }
    }

    Ok(outcome)
}

fn display_name(person: &PersonRecord, roster: &[RosterMember]) -> String {
    if !person.main_name.trim().is_empty() {
        return person.main_name.clone();
    }
    roster
        .iter()
        .find(|m| m.persona_id == person.main_persona_id && !m.name.trim().is_empty())
        .map(|m| m.name.clone())
        .unwrap_or_else(|| resolver::UNKNOWN_NAME.to_string())
}

// ============================================================================
// TESTS
// ============================================================================
