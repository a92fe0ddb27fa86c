// Transaction importer
//
// Turns raw ledger entries into pending payments, exactly once each. The
// whole feed page and the person map are fetched before the write
// transaction opens. Matching runs against every stored eligible entry, not
// just the current page, so an entry that had no account when it arrived is
// picked up on a later run. Dedup rides on the (owner, entry id) uniqueness
// constraint; a conflicting insert is a no-op, never an error.

use rusqlite::Connection;
use serde_json::json;
use tracing::{debug, info};

use crate::db;
use crate::entities::{
    AccountRepository, HistoryRepository, NewPayment, PaymentAction, PaymentRepository,
    PaymentStatus,
};
use crate::entities::OwnerRepository;
use crate::error::Result;
use crate::providers::{IdentityLookup, LedgerFeed, PersonaSetProvider};
use crate::resolver;
use crate::rules::{self, RuleOutcome};

/// Counters for one import run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub fetched: usize,
    pub ingested: usize,
    pub duplicates: usize,
    pub payments_created: usize,
    pub rules: RuleOutcome,
}

impl ImportOutcome {
    pub fn summary(&self) -> String {
        format!(
            "{} entries fetched ({} new, {} seen before), {} payments created; rules: {}",
            self.fetched,
            self.ingested,
            self.duplicates,
            self.payments_created,
            self.rules.summary(),
        )
    }
}

/// Import one owner's ledger feed and classify the resulting payments.
pub fn import(
    conn: &mut Connection,
    owner_id: i64,
    feed: &dyn LedgerFeed,
    people_provider: &dyn PersonaSetProvider,
    lookup: &dyn IdentityLookup,
) -> Result<ImportOutcome> {
    let owner = OwnerRepository::get(conn, owner_id)?;

    let entries = feed.fetch_entries()?;
    let people = people_provider.fetch_people()?;

    // Warm the name cache for every party the page mentions. A dead lookup
    // degrades to placeholders and never blocks the import.
    let mut party_ids: Vec<i64> = Vec::with_capacity(entries.len() * 2);
    for entry in &entries {
        party_ids.push(entry.first_party_id);
        party_ids.push(entry.second_party_id);
    }
    if !party_ids.is_empty() {
        resolver::resolve(conn, lookup, &party_ids)?;
    }

    let mut outcome = ImportOutcome {
        fetched: entries.len(),
        ..ImportOutcome::default()
    };

    let tx = conn.transaction()?;

    let stats = db::insert_ledger_entries(&tx, owner.id, &entries)?;
    outcome.ingested = stats.inserted;
    outcome.duplicates = stats.duplicates;

    // persona -> (account id, account name) for every payer of this owner.
    let mut account_by_persona = std::collections::HashMap::new();
    let accounts = AccountRepository::list_for_owner(&tx, owner.id)?;
    for account in &accounts {
        if let Some(person) = people.iter().find(|p| p.person_id == account.person_id) {
            for persona in &person.personas {
                account_by_persona.insert(*persona, (account.id, account.name.clone()));
            }
        }
    }

    let imported = PaymentRepository::imported_entry_ids(&tx, owner.id)?;

    for entry in db::eligible_entries(&tx, owner.id)? {
        if imported.contains(&entry.entry_id) {
            continue;
        }
        let Some((account_id, payer_name)) = account_by_persona.get(&entry.first_party_id) else {
            debug!(entry = entry.entry_id, sender = entry.first_party_id, "no payer account for sender");
            continue;
        };

        let created = PaymentRepository::insert(
            &tx,
            owner.id,
            &NewPayment {
                account_id: *account_id,
                entry_id: Some(entry.entry_id),
                payer_name: payer_name.clone(),
                amount: entry.amount,
                date: entry.date,
                reason: entry.reason.clone(),
                status: PaymentStatus::Pending,
                reviser: None,
            },
        )?;

        if let Some(payment_id) = created {
            HistoryRepository::log_payment(
                &tx,
                owner.id,
                payment_id,
                "System",
                PaymentAction::Added,
                PaymentStatus::Pending,
                "Payment added.",
                Some(&json!({ "entry_id": entry.entry_id, "amount": entry.amount })),
            )?;
            outcome.payments_created += 1;
        }
    }

    tx.commit()?;

    outcome.rules = rules::run(conn, owner.id)?;

    info!(owner = %owner.name, "import: {}", outcome.summary());
    Ok(outcome)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{setup_database, LedgerEntry};
    use crate::entities::{Owner, OwnerKind, PayerAccount};
    use crate::providers::fixtures::{person, StaticLedger, StaticLookup, StaticPeople};
    use chrono::{Duration, Utc};

    const CORP_A: i64 = 98000001;

    fn setup() -> (Connection, Owner, PayerAccount) {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let owner = OwnerRepository::register(
            &conn,
            OwnerKind::Corporation,
            CORP_A,
            "Corp Alpha",
            1000,
            30,
            Utc::now(),
        )
        .unwrap();
        let account =
            AccountRepository::create(&conn, owner.id, 9001, "Orren Kalda", Utc::now()).unwrap();
        (conn, owner, account)
    }

    fn people() -> StaticPeople {
        StaticPeople(vec![person(
            9001,
            501,
            "Orren Kalda",
            Some(CORP_A),
            &[501, 502],
        )])
    }

    fn entry(id: i64, from: i64, amount: i64, reason: &str, entry_type: &str) -> LedgerEntry {
        LedgerEntry {
            entry_id: id,
            first_party_id: from,
            second_party_id: CORP_A,
            amount,
            date: Utc::now() - Duration::minutes(100 - id),
            reason: reason.to_string(),
            entry_type: entry_type.to_string(),
        }
    }

    fn no_names() -> StaticLookup {
        StaticLookup::new(&[])
    }

    #[test]
    fn test_import_creates_payments_verbatim() {
        let (mut conn, owner, account) = setup();
        let feed = StaticLedger(vec![
            entry(1, 501, 250_000, "tax march", "player_donation"),
            entry(2, 502, 90_000, "alt paying", "player_donation"),
            entry(3, 501, 42, "rent", "office_rent"),
            entry(4, 777, 5_000, "stranger", "player_donation"),
        ]);

        let outcome = import(&mut conn, owner.id, &feed, &people(), &no_names()).unwrap();

        assert_eq!(outcome.fetched, 4);
        assert_eq!(outcome.ingested, 4);
        assert_eq!(outcome.payments_created, 2);

        let payments = PaymentRepository::list_for_owner(&conn, owner.id).unwrap();
        assert_eq!(payments.len(), 2);
        for payment in &payments {
            assert_eq!(payment.account_id, account.id);
            assert_eq!(payment.payer_name, "Orren Kalda");
            // No rule groups configured: everything routes to manual review.
            assert_eq!(payment.status, PaymentStatus::NeedsApproval);
        }
        let matched = payments.iter().find(|p| p.entry_id == Some(1)).unwrap();
        assert_eq!(matched.amount, 250_000);
        assert_eq!(matched.reason, "tax march");
    }

    #[test]
    fn test_import_is_idempotent() {
        let (mut conn, owner, _) = setup();
        let feed = StaticLedger(vec![
            entry(1, 501, 1000, "tax", "player_donation"),
            entry(2, 502, 2000, "tax", "player_donation"),
        ]);

        let first = import(&mut conn, owner.id, &feed, &people(), &no_names()).unwrap();
        assert_eq!(first.payments_created, 2);

        let second = import(&mut conn, owner.id, &feed, &people(), &no_names()).unwrap();
        assert_eq!(second.payments_created, 0);
        assert_eq!(second.ingested, 0);
        assert_eq!(second.duplicates, 2);

        let payments = PaymentRepository::list_for_owner(&conn, owner.id).unwrap();
        assert_eq!(payments.len(), 2);

        // Exactly one "added" audit entry per payment.
        for payment in &payments {
            let trail = HistoryRepository::payment_trail(&conn, payment.id).unwrap();
            let added = trail
                .iter()
                .filter(|e| e.action == PaymentAction::Added)
                .count();
            assert_eq!(added, 1);
        }
    }

    #[test]
    fn test_overlapping_pages_union() {
        let (mut conn, owner, _) = setup();
        let page_one = StaticLedger(vec![
            entry(1, 501, 1000, "a", "player_donation"),
            entry(2, 501, 2000, "b", "player_donation"),
        ]);
        let page_two = StaticLedger(vec![
            entry(2, 501, 2000, "b", "player_donation"),
            entry(3, 501, 3000, "c", "player_donation"),
        ]);

        import(&mut conn, owner.id, &page_one, &people(), &no_names()).unwrap();
        let outcome = import(&mut conn, owner.id, &page_two, &people(), &no_names()).unwrap();

        assert_eq!(outcome.payments_created, 1);
        let payments = PaymentRepository::list_for_owner(&conn, owner.id).unwrap();
        assert_eq!(payments.len(), 3);
    }

    #[test]
    fn test_stored_entry_matches_once_account_exists() {
        let (mut conn, owner, _) = setup();
        // Sender 601 belongs to nobody we know yet.
        let feed = StaticLedger(vec![entry(9, 601, 7000, "early bird", "player_donation")]);

        let outcome = import(&mut conn, owner.id, &feed, &people(), &no_names()).unwrap();
        assert_eq!(outcome.payments_created, 0);
        assert_eq!(db::ledger_entry_count(&conn, owner.id).unwrap(), 1);

        // The person registers and gets an account; an empty page later the
        // stored entry still becomes a payment.
        AccountRepository::create(&conn, owner.id, 9002, "Mira Senn", Utc::now()).unwrap();
        let richer_people = StaticPeople(vec![
            person(9001, 501, "Orren Kalda", Some(CORP_A), &[501, 502]),
            person(9002, 601, "Mira Senn", Some(CORP_A), &[601]),
        ]);

        let outcome = import(
            &mut conn,
            owner.id,
            &StaticLedger(vec![]),
            &richer_people,
            &no_names(),
        )
        .unwrap();
        assert_eq!(outcome.payments_created, 1);

        let payments = PaymentRepository::list_for_owner(&conn, owner.id).unwrap();
        assert_eq!(payments[0].payer_name, "Mira Senn");
        assert_eq!(payments[0].entry_id, Some(9));
    }

    #[test]
    fn test_party_names_cached_for_display() {
        let (mut conn, owner, _) = setup();
        let feed = StaticLedger(vec![entry(1, 501, 1000, "tax", "player_donation")]);
        let lookup = StaticLookup::new(&[(501, "Orren Kalda"), (CORP_A, "Corp Alpha")]);

        import(&mut conn, owner.id, &feed, &people(), &lookup).unwrap();

        let names = db::cached_entity_names(&conn, &[501, CORP_A]).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(lookup.calls.get(), 1);
    }
}
