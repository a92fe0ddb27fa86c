// Engine facade
//
// TaxEngine owns the SQLite connection and is the single entry point the CLI
// and any API layer talk to. It re-enforces actor permissions at the
// operation boundary, opens the unit of work for each state transition,
// retries a conflicted commit once, and stamps the owner's section
// timestamps after every successful trigger run. Review operations return an
// OpReport instead of a bare Result so callers always get a display-safe
// message.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use tracing::{info, warn};

use crate::db;
use crate::db::setup_database;
use crate::directory::{self, SyncOutcome};
use crate::entities::{
    AccountRepository, AccountStatus, AdminAction, HistoryRepository, Owner, OwnerKind,
    OwnerRepository, Reviser, UpdateSection,
};
use crate::error::{Error, ErrorKind, Result};
use crate::importer::{self, ImportOutcome};
use crate::payday::{self, PaydayOutcome};
use crate::payments;
use crate::providers::{IdentityLookup, LedgerFeed, PersonaSetProvider, RosterProvider};
use crate::queries::{require_manage, AccessScope, Actor};
use crate::rules::{self, Criterion, Filter, FilterSet, FilterSetRepository, RuleOutcome};

// ============================================================================
// OPERATION REPORTS
// ============================================================================

/// Structured outcome of a review operation. `message` is safe to show a
/// user verbatim; `error` carries the kind so callers can branch without
/// string matching.
#[derive(Debug, Clone, Serialize)]
pub struct OpReport {
    pub success: bool,
    pub message: String,
    pub error: Option<ErrorKind>,
}

impl OpReport {
    fn ok(message: &str) -> Self {
        OpReport {
            success: true,
            message: message.to_string(),
            error: None,
        }
    }

    fn failed(err: Error) -> Self {
        OpReport {
            success: false,
            message: err.user_message(),
            error: Some(err.kind()),
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct TaxEngine {
    conn: Connection,
}

impl TaxEngine {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = db::open_database(path.as_ref())?;
        Ok(TaxEngine { conn })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(TaxEngine { conn })
    }

    /// Read access for the query layer.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ------------------------------------------------------------------
    // Triggers. Each skips inactive owners, retries once on a commit
    // conflict and stamps its section timestamp on success. `None` means
    // the owner is inactive and nothing ran.
    // ------------------------------------------------------------------

    pub fn sync_members(
        &mut self,
        owner_id: i64,
        roster: &dyn RosterProvider,
        people: &dyn PersonaSetProvider,
        lookup: &dyn IdentityLookup,
    ) -> Result<Option<SyncOutcome>> {
        if self.skip_inactive(owner_id, "member sync")? {
            return Ok(None);
        }
        let conn = &mut self.conn;
        let outcome = retry_once(|| directory::sync(conn, owner_id, roster, people, lookup))?;
        self.stamp(owner_id, UpdateSection::MemberSync)?;
        Ok(Some(outcome))
    }

    pub fn import_payments(
        &mut self,
        owner_id: i64,
        feed: &dyn LedgerFeed,
        people: &dyn PersonaSetProvider,
        lookup: &dyn IdentityLookup,
    ) -> Result<Option<ImportOutcome>> {
        if self.skip_inactive(owner_id, "import")? {
            return Ok(None);
        }
        let conn = &mut self.conn;
        let outcome = retry_once(|| importer::import(conn, owner_id, feed, people, lookup))?;
        // The importer runs the rule engine, so both sections advanced.
        self.stamp(owner_id, UpdateSection::Import)?;
        self.stamp(owner_id, UpdateSection::RuleRun)?;
        Ok(Some(outcome))
    }

    pub fn run_rules(&mut self, owner_id: i64) -> Result<Option<RuleOutcome>> {
        if self.skip_inactive(owner_id, "rule run")? {
            return Ok(None);
        }
        let conn = &mut self.conn;
        let outcome = retry_once(|| rules::run(conn, owner_id))?;
        self.stamp(owner_id, UpdateSection::RuleRun)?;
        Ok(Some(outcome))
    }

    pub fn run_payday(&mut self, owner_id: i64) -> Result<Option<PaydayOutcome>> {
        if self.skip_inactive(owner_id, "payday")? {
            return Ok(None);
        }
        let conn = &mut self.conn;
        let outcome = retry_once(|| payday::run(conn, owner_id))?;
        self.stamp(owner_id, UpdateSection::Payday)?;
        Ok(Some(outcome))
    }

    fn skip_inactive(&self, owner_id: i64, trigger: &str) -> Result<bool> {
        let owner = OwnerRepository::get(&self.conn, owner_id)?;
        if owner.active {
            return Ok(false);
        }
        info!(owner = %owner.name, "owner inactive, {} skipped", trigger);
        Ok(true)
    }

    fn stamp(&self, owner_id: i64, section: UpdateSection) -> Result<()> {
        OwnerRepository::stamp_section(&self.conn, owner_id, section, Utc::now())
    }

    // ------------------------------------------------------------------
    // Review operations. Permission first, then one atomic unit per
    // payment, then a display-safe report either way.
    // ------------------------------------------------------------------

    pub fn approve_payment(
        &mut self,
        actor: &Actor,
        owner_id: i64,
        payment_id: i64,
        comment: &str,
    ) -> OpReport {
        self.review(actor, owner_id, "Payment approved.", |tx, reviser| {
            payments::approve(tx, owner_id, payment_id, reviser, comment).map(|_| ())
        })
    }

    pub fn reject_payment(
        &mut self,
        actor: &Actor,
        owner_id: i64,
        payment_id: i64,
        comment: &str,
    ) -> OpReport {
        self.review(actor, owner_id, "Payment rejected.", |tx, reviser| {
            payments::reject(tx, owner_id, payment_id, reviser, comment).map(|_| ())
        })
    }

    pub fn undo_payment(
        &mut self,
        actor: &Actor,
        owner_id: i64,
        payment_id: i64,
        comment: &str,
    ) -> OpReport {
        self.review(actor, owner_id, "Payment undone.", |tx, reviser| {
            payments::undo(tx, owner_id, payment_id, reviser, comment).map(|_| ())
        })
    }

    pub fn delete_payment(&mut self, actor: &Actor, owner_id: i64, payment_id: i64) -> OpReport {
        self.review(actor, owner_id, "Payment deleted.", |tx, reviser| {
            payments::delete(tx, owner_id, payment_id, reviser)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_payment(
        &mut self,
        actor: &Actor,
        owner_id: i64,
        account_id: i64,
        amount: i64,
        date: DateTime<Utc>,
        reason: &str,
    ) -> OpReport {
        self.review(actor, owner_id, "Payment added.", |tx, reviser| {
            payments::add_manual(tx, owner_id, account_id, amount, date, reason, reviser)
                .map(|_| ())
        })
    }

    fn review<F>(&mut self, actor: &Actor, owner_id: i64, done: &str, op: F) -> OpReport
    where
        F: Fn(&Transaction<'_>, &Reviser) -> Result<()>,
    {
        match self.try_review(actor, owner_id, &op) {
            Ok(()) => OpReport::ok(done),
            Err(err) => {
                warn!(owner = owner_id, error = %err, "review operation failed");
                OpReport::failed(err)
            }
        }
    }

    fn try_review<F>(&mut self, actor: &Actor, owner_id: i64, op: &F) -> Result<()>
    where
        F: Fn(&Transaction<'_>, &Reviser) -> Result<()>,
    {
        require_manage(actor, owner_id)?;
        let reviser = Reviser::Human(actor.name.clone());
        let attempt = |conn: &mut Connection| -> Result<()> {
            let tx = conn.transaction()?;
            op(&tx, &reviser)?;
            tx.commit()?;
            Ok(())
        };
        match attempt(&mut self.conn) {
            Err(err) if err.is_conflict() => {
                warn!(owner = owner_id, "commit conflict, retrying once");
                attempt(&mut self.conn)
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Owner administration
    // ------------------------------------------------------------------

    /// Register a new taxed organization. Full scope only.
    pub fn register_owner(
        &mut self,
        actor: &Actor,
        kind: OwnerKind,
        external_id: i64,
        name: &str,
        tax_amount: i64,
        tax_period_days: i64,
    ) -> Result<Owner> {
        if actor.scope != AccessScope::Full {
            return Err(Error::PermissionDenied {
                actor: actor.name.clone(),
                owner_id: external_id,
            });
        }
        let tx = self.conn.transaction()?;
        let owner = OwnerRepository::register(
            &tx,
            kind,
            external_id,
            name,
            tax_amount,
            tax_period_days,
            Utc::now(),
        )?;
        HistoryRepository::log_admin(
            &tx,
            owner.id,
            &actor.name,
            AdminAction::Add,
            &format!("Owner '{}' registered.", owner.name),
        )?;
        tx.commit()?;
        info!(owner = %owner.name, external = external_id, "owner registered");
        Ok(owner)
    }

    pub fn update_tax_amount(&mut self, actor: &Actor, owner_id: i64, amount: i64) -> Result<()> {
        self.admin(actor, owner_id, AdminAction::Change, |tx| {
            OwnerRepository::update_tax_amount(tx, owner_id, amount)?;
            Ok(format!("Tax amount changed to {}.", amount))
        })
    }

    pub fn update_tax_period(&mut self, actor: &Actor, owner_id: i64, days: i64) -> Result<()> {
        self.admin(actor, owner_id, AdminAction::Change, |tx| {
            OwnerRepository::update_tax_period(tx, owner_id, days)?;
            Ok(format!("Tax period changed to {} days.", days))
        })
    }

    pub fn set_owner_active(&mut self, actor: &Actor, owner_id: i64, active: bool) -> Result<()> {
        self.admin(actor, owner_id, AdminAction::Change, |tx| {
            OwnerRepository::set_active(tx, owner_id, active)?;
            Ok(format!(
                "Owner set {}.",
                if active { "active" } else { "inactive" }
            ))
        })
    }

    /// Switch an account between Active and Deactivated. Other statuses are
    /// owned by the directory sync and cannot be set by hand.
    pub fn set_account_status(
        &mut self,
        actor: &Actor,
        owner_id: i64,
        account_id: i64,
        status: AccountStatus,
    ) -> Result<()> {
        if !matches!(status, AccountStatus::Active | AccountStatus::Deactivated) {
            return Err(Error::Validation {
                field: "status",
                reason: "accounts switch between active and deactivated only".to_string(),
            });
        }
        self.admin(actor, owner_id, AdminAction::Change, |tx| {
            let account = AccountRepository::get(tx, account_id)?;
            if account.owner_id != owner_id {
                return Err(Error::NotFound {
                    entity: "Payer account",
                    id: account_id,
                });
            }
            AccountRepository::set_status(tx, account_id, status)?;
            Ok(format!("Account '{}' switched to {}.", account.name, status))
        })
    }

    // ------------------------------------------------------------------
    // Rule group administration
    // ------------------------------------------------------------------

    pub fn create_rule_group(
        &mut self,
        actor: &Actor,
        owner_id: i64,
        name: &str,
        description: &str,
    ) -> Result<FilterSet> {
        require_manage(actor, owner_id)?;
        let tx = self.conn.transaction()?;
        let set = FilterSetRepository::create(&tx, owner_id, name, description)?;
        HistoryRepository::log_admin(
            &tx,
            owner_id,
            &actor.name,
            AdminAction::Add,
            &format!("Rule group '{}' created.", set.name),
        )?;
        tx.commit()?;
        Ok(set)
    }

    pub fn add_rule(
        &mut self,
        actor: &Actor,
        owner_id: i64,
        group_id: i64,
        criterion: Criterion,
    ) -> Result<Filter> {
        require_manage(actor, owner_id)?;
        let tx = self.conn.transaction()?;
        let set = FilterSetRepository::get_for_owner(&tx, owner_id, group_id)?;
        let filter = FilterSetRepository::add_filter(&tx, set.id, &criterion)?;
        HistoryRepository::log_admin(
            &tx,
            owner_id,
            &actor.name,
            AdminAction::Change,
            &format!("Rule added to group '{}': {}.", set.name, criterion.describe()),
        )?;
        tx.commit()?;
        Ok(filter)
    }

    pub fn remove_rule(
        &mut self,
        actor: &Actor,
        owner_id: i64,
        group_id: i64,
        rule_id: i64,
    ) -> Result<()> {
        self.admin(actor, owner_id, AdminAction::Change, |tx| {
            let set = FilterSetRepository::get_for_owner(tx, owner_id, group_id)?;
            if !set.filters.iter().any(|f| f.id == rule_id) {
                return Err(Error::NotFound {
                    entity: "Filter",
                    id: rule_id,
                });
            }
            FilterSetRepository::remove_filter(tx, rule_id)?;
            Ok(format!("Rule removed from group '{}'.", set.name))
        })
    }

    pub fn set_rule_group_enabled(
        &mut self,
        actor: &Actor,
        owner_id: i64,
        group_id: i64,
        enabled: bool,
    ) -> Result<()> {
        self.admin(actor, owner_id, AdminAction::Change, |tx| {
            let set = FilterSetRepository::get_for_owner(tx, owner_id, group_id)?;
            FilterSetRepository::set_enabled(tx, set.id, enabled)?;
            Ok(format!(
                "Rule group '{}' {}.",
                set.name,
                if enabled { "enabled" } else { "disabled" }
            ))
        })
    }

    pub fn delete_rule_group(&mut self, actor: &Actor, owner_id: i64, group_id: i64) -> Result<()> {
        self.admin(actor, owner_id, AdminAction::Delete, |tx| {
            let set = FilterSetRepository::get_for_owner(tx, owner_id, group_id)?;
            FilterSetRepository::delete(tx, set.id)?;
            Ok(format!("Rule group '{}' deleted.", set.name))
        })
    }

    /// Shared shape of the small admin writes: permission check, one
    /// transaction around the change and its history entry.
    fn admin<F>(&mut self, actor: &Actor, owner_id: i64, action: AdminAction, op: F) -> Result<()>
    where
        F: Fn(&Transaction<'_>) -> Result<String>,
    {
        require_manage(actor, owner_id)?;
        let tx = self.conn.transaction()?;
        let comment = op(&tx)?;
        HistoryRepository::log_admin(&tx, owner_id, &actor.name, action, &comment)?;
        tx.commit()?;
        info!(owner = owner_id, actor = %actor.name, "{}", comment);
        Ok(())
    }
}

/// Run `op`, and once more if the first run died on a commit conflict.
fn retry_once<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Err(err) if err.is_conflict() => {
            warn!("commit conflict, retrying once");
            op()
        }
        other => other,
    }
}

// ============================================================================
// TESTS
// ============================================================================
