// tax-ledger CLI
//
// Operator tooling over the engine: one subcommand per trigger or review
// action, CSV files as the provider adapters. Structured logs go to stderr
// (RUST_LOG), human report lines to stdout.

use std::collections::HashMap;
use std::env;
use std::process;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing_subscriber::EnvFilter;

use tax_ledger::{
    queries, Actor, CsvLedgerFile, CsvNameFile, CsvPersonaFile, CsvRosterFile, IdentityLookup,
    OwnerKind, PaymentStatus, TaxEngine,
};

const DEFAULT_DB: &str = "tax_ledger.db";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = env::args().skip(1).collect();
    let Some(command) = argv.first().cloned() else {
        print_usage();
        process::exit(2);
    };
    let args = Args::parse(&argv[1..])?;

    match command.as_str() {
        "init" => cmd_init(&args),
        "add-owner" => cmd_add_owner(&args),
        "sync" => cmd_sync(&args),
        "import" => cmd_import(&args),
        "rules" => cmd_rules(&args),
        "payday" => cmd_payday(&args),
        "approve" => cmd_review(&args, Review::Approve),
        "reject" => cmd_review(&args, Review::Reject),
        "undo" => cmd_review(&args, Review::Undo),
        "delete" => cmd_review(&args, Review::Delete),
        "add-payment" => cmd_add_payment(&args),
        "accounts" => cmd_accounts(&args),
        "payments" => cmd_payments(&args),
        "stats" => cmd_stats(&args),
        "history" => cmd_history(&args),
        "help" | "--help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command '{}'.", other);
            print_usage();
            process::exit(2);
        }
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

fn cmd_init(args: &Args) -> Result<()> {
    let path = args.db_path();
    TaxEngine::open(&path)?;
    println!("✓ Ledger database ready at {}", path);
    Ok(())
}

fn cmd_add_owner(args: &Args) -> Result<()> {
    let kind = args.positional(0, "kind (corporation|alliance)")?;
    let kind = OwnerKind::parse(&kind)
        .with_context(|| format!("unknown owner kind '{}'", kind))?;
    let external_id = args.positional_i64(1, "external organization id")?;
    let name = args.positional(2, "name")?;
    let tax_amount = args.positional_i64(3, "tax amount")?;
    let tax_period = args.positional_i64(4, "tax period in days")?;

    let mut engine = TaxEngine::open(args.db_path())?;
    let owner = engine.register_owner(
        &args.actor(),
        kind,
        external_id,
        &name,
        tax_amount,
        tax_period,
    )?;
    println!(
        "✓ Owner '{}' registered with id {} ({} every {} days)",
        owner.name, owner.id, owner.tax_amount, owner.tax_period_days
    );
    Ok(())
}

fn cmd_sync(args: &Args) -> Result<()> {
    let owner_id = args.positional_i64(0, "owner id")?;
    let roster = CsvRosterFile::new(args.require("roster")?);
    let persons = CsvPersonaFile::new(args.require("persons")?);
    let lookup = args.lookup();

    let mut engine = TaxEngine::open(args.db_path())?;
    match engine.sync_members(owner_id, &roster, &persons, lookup.as_ref())? {
        Some(outcome) => println!("✓ {}", outcome.summary()),
        None => println!("Owner {} is inactive, nothing to do.", owner_id),
    }
    Ok(())
}

fn cmd_import(args: &Args) -> Result<()> {
    let owner_id = args.positional_i64(0, "owner id")?;
    let ledger = CsvLedgerFile::new(args.require("ledger")?);
    let persons = CsvPersonaFile::new(args.require("persons")?);
    let lookup = args.lookup();

    let mut engine = TaxEngine::open(args.db_path())?;
    match engine.import_payments(owner_id, &ledger, &persons, lookup.as_ref())? {
        Some(outcome) => {
            println!("✓ {}", outcome.summary());
            println!("✓ {}", outcome.rules.summary());
        }
        None => println!("Owner {} is inactive, nothing to do.", owner_id),
    }
    Ok(())
}

fn cmd_rules(args: &Args) -> Result<()> {
    let owner_id = args.positional_i64(0, "owner id")?;
    let mut engine = TaxEngine::open(args.db_path())?;
    match engine.run_rules(owner_id)? {
        Some(outcome) => println!("✓ {}", outcome.summary()),
        None => println!("Owner {} is inactive, nothing to do.", owner_id),
    }
    Ok(())
}

fn cmd_payday(args: &Args) -> Result<()> {
    let owner_id = args.positional_i64(0, "owner id")?;
    let mut engine = TaxEngine::open(args.db_path())?;
    match engine.run_payday(owner_id)? {
        Some(outcome) => println!("✓ {}", outcome.summary()),
        None => println!("Owner {} is inactive, nothing to do.", owner_id),
    }
    Ok(())
}

enum Review {
    Approve,
    Reject,
    Undo,
    Delete,
}

fn cmd_review(args: &Args, review: Review) -> Result<()> {
    let owner_id = args.positional_i64(0, "owner id")?;
    let payment_id = args.positional_i64(1, "payment id")?;
    let actor = args.actor();
    let comment = args.flag("comment").unwrap_or_default();

    let mut engine = TaxEngine::open(args.db_path())?;
    let report = match review {
        Review::Approve => engine.approve_payment(&actor, owner_id, payment_id, &comment),
        Review::Reject => engine.reject_payment(&actor, owner_id, payment_id, &comment),
        Review::Undo => engine.undo_payment(&actor, owner_id, payment_id, &comment),
        Review::Delete => engine.delete_payment(&actor, owner_id, payment_id),
    };
    println!("{}", report.message);
    if !report.success {
        process::exit(1);
    }
    Ok(())
}

fn cmd_add_payment(args: &Args) -> Result<()> {
    let owner_id = args.positional_i64(0, "owner id")?;
    let account_id = args.positional_i64(1, "account id")?;
    let amount = args.positional_i64(2, "amount")?;
    let reason = args.positional(3, "reason")?;
    let date = match args.flag("date") {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .with_context(|| format!("invalid --date '{}'", raw))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let mut engine = TaxEngine::open(args.db_path())?;
    let report = engine.add_payment(&args.actor(), owner_id, account_id, amount, date, &reason);
    println!("{}", report.message);
    if !report.success {
        process::exit(1);
    }
    Ok(())
}

fn cmd_accounts(args: &Args) -> Result<()> {
    let owner_id = args.positional_i64(0, "owner id")?;
    let engine = TaxEngine::open(args.db_path())?;
    let accounts = queries::list_accounts(engine.connection(), &args.actor(), owner_id)?;

    if args.json() {
        println!("{}", serde_json::to_string_pretty(&accounts)?);
        return Ok(());
    }
    println!("{:>6}  {:<28} {:<12} {:>14}  last paid", "id", "name", "status", "deposit");
    for account in &accounts {
        println!(
            "{:>6}  {:<28} {:<12} {:>14}  {}",
            account.id,
            account.name,
            account.status.to_string(),
            account.deposit,
            account
                .last_paid
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
        );
    }
    println!("{} account(s)", accounts.len());
    Ok(())
}

fn cmd_payments(args: &Args) -> Result<()> {
    let owner_id = args.positional_i64(0, "owner id")?;
    let status = match args.flag("status") {
        Some(raw) => Some(
            PaymentStatus::parse(&raw)
                .with_context(|| format!("unknown payment status '{}'", raw))?,
        ),
        None => None,
    };

    let engine = TaxEngine::open(args.db_path())?;
    let payments = queries::list_payments(engine.connection(), &args.actor(), owner_id, status)?;

    if args.json() {
        println!("{}", serde_json::to_string_pretty(&payments)?);
        return Ok(());
    }
    println!(
        "{:>6}  {:<24} {:>12}  {:<16} {:<20} reason",
        "id", "payer", "amount", "status", "reviser"
    );
    for payment in &payments {
        println!(
            "{:>6}  {:<24} {:>12}  {:<16} {:<20} {}",
            payment.id,
            payment.payer_name,
            payment.amount,
            payment.status.to_string(),
            payment
                .reviser
                .as_ref()
                .map(|r| r.display_name().to_string())
                .unwrap_or_default(),
            payment.reason,
        );
    }
    println!("{} payment(s)", payments.len());
    Ok(())
}

fn cmd_stats(args: &Args) -> Result<()> {
    let owner_id = args.positional_i64(0, "owner id")?;
    let engine = TaxEngine::open(args.db_path())?;
    let stats = queries::statistics(engine.connection(), &args.actor(), owner_id)?;

    if args.json() {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!(
        "{} (tax {} every {} days{})",
        stats.owner.name,
        stats.owner.tax_amount,
        stats.owner.tax_period_days,
        if stats.owner.active { "" } else { ", inactive" },
    );
    println!(
        "accounts: {} total, {} active ({} paid / {} unpaid), {} inactive, {} deactivated, {} missing",
        stats.accounts.total,
        stats.accounts.active,
        stats.accounts.paid,
        stats.accounts.unpaid,
        stats.accounts.inactive,
        stats.accounts.deactivated,
        stats.accounts.missing,
    );
    println!(
        "payments: {} total, {} pending, {} flagged, {} approved ({} auto / {} reviewed), {} rejected",
        stats.payments.total,
        stats.payments.pending,
        stats.payments.needs_approval,
        stats.payments.approved,
        stats.payments.auto_approved,
        stats.payments.human_reviewed,
        stats.payments.rejected,
    );
    println!(
        "members: {} total, {} active, {} missing, {} alts, {} unregistered",
        stats.members.total,
        stats.members.active,
        stats.members.missing,
        stats.members.alts,
        stats.members.unregistered,
    );
    Ok(())
}

fn cmd_history(args: &Args) -> Result<()> {
    let owner_id = args.positional_i64(0, "owner id")?;
    let payment_id = args.positional_i64(1, "payment id")?;
    let engine = TaxEngine::open(args.db_path())?;
    let trail = queries::payment_trail(engine.connection(), &args.actor(), owner_id, payment_id)?;

    if args.json() {
        println!("{}", serde_json::to_string_pretty(&trail)?);
        return Ok(());
    }
    for entry in &trail {
        println!(
            "{}  {:<20} {:<14} -> {:<16} {}",
            entry.date.to_rfc3339(),
            entry.actor,
            entry.action.as_str(),
            entry.new_status.to_string(),
            entry.comment,
        );
    }
    println!("{} entr{}", trail.len(), if trail.len() == 1 { "y" } else { "ies" });
    Ok(())
}

// ============================================================================
// ARGUMENT HANDLING
// ============================================================================

/// Flags take a value (`--db ledger.db`) except `--json`, which is a switch.
struct Args {
    positionals: Vec<String>,
    flags: HashMap<String, String>,
    json: bool,
}

impl Args {
    fn parse(raw: &[String]) -> Result<Args> {
        let mut positionals = Vec::new();
        let mut flags = HashMap::new();
        let mut json = false;

        let mut iter = raw.iter();
        while let Some(token) = iter.next() {
            if token == "--json" {
                json = true;
            } else if let Some(name) = token.strip_prefix("--") {
                let value = iter
                    .next()
                    .with_context(|| format!("--{} needs a value", name))?;
                flags.insert(name.to_string(), value.clone());
            } else {
                positionals.push(token.clone());
            }
        }
        Ok(Args {
            positionals,
            flags,
            json,
        })
    }

    fn positional(&self, index: usize, what: &str) -> Result<String> {
        self.positionals
            .get(index)
            .cloned()
            .with_context(|| format!("missing argument: {}", what))
    }

    fn positional_i64(&self, index: usize, what: &str) -> Result<i64> {
        let raw = self.positional(index, what)?;
        raw.parse()
            .with_context(|| format!("{} must be a number, got '{}'", what, raw))
    }

    fn flag(&self, name: &str) -> Option<String> {
        self.flags.get(name).cloned()
    }

    fn require(&self, name: &str) -> Result<String> {
        self.flag(name)
            .with_context(|| format!("missing required flag --{}", name))
    }

    fn json(&self) -> bool {
        self.json
    }

    fn db_path(&self) -> String {
        self.flag("db")
            .or_else(|| env::var("TAX_LEDGER_DB").ok())
            .unwrap_or_else(|| DEFAULT_DB.to_string())
    }

    /// The CLI runs with operator rights; `--actor` only sets the audit name.
    fn actor(&self) -> Actor {
        Actor::admin(self.flag("actor").unwrap_or_else(|| "Admin".to_string()))
    }

    fn lookup(&self) -> Box<dyn IdentityLookup> {
        match self.flag("names") {
            Some(path) => Box::new(CsvNameFile::new(path)),
            None => Box::new(NoLookup),
        }
    }
}

/// Stand-in when no id-to-name file is given; unresolved parties keep the
/// placeholder name.
struct NoLookup;

impl IdentityLookup for NoLookup {
    fn lookup_names(&self, _ids: &[i64]) -> anyhow::Result<HashMap<i64, String>> {
        Ok(HashMap::new())
    }
}

fn print_usage() {
    eprintln!("tax-ledger {}", tax_ledger::VERSION);
    eprintln!();
    eprintln!("Usage: tax-ledger <command> [args] [--db PATH]");
    eprintln!();
    eprintln!("Setup:");
    eprintln!("  init");
    eprintln!("  add-owner <corporation|alliance> <org-id> <name> <tax-amount> <period-days>");
    eprintln!();
    eprintln!("Triggers:");
    eprintln!("  sync    <owner-id> --roster FILE --persons FILE [--names FILE]");
    eprintln!("  import  <owner-id> --ledger FILE --persons FILE [--names FILE]");
    eprintln!("  rules   <owner-id>");
    eprintln!("  payday  <owner-id>");
    eprintln!();
    eprintln!("Review (use --actor NAME, --comment TEXT):");
    eprintln!("  approve <owner-id> <payment-id>");
    eprintln!("  reject  <owner-id> <payment-id>");
    eprintln!("  undo    <owner-id> <payment-id>");
    eprintln!("  delete  <owner-id> <payment-id>");
    eprintln!("  add-payment <owner-id> <account-id> <amount> <reason> [--date RFC3339]");
    eprintln!();
    eprintln!("Reads (--json for machine output):");
    eprintln!("  accounts <owner-id>");
    eprintln!("  payments <owner-id> [--status pending|needs_approval|approved|rejected]");
    eprintln!("  stats    <owner-id>");
    eprintln!("  history  <owner-id> <payment-id>");
    eprintln!();
    eprintln!("Database path: --db, TAX_LEDGER_DB, or ./{}", DEFAULT_DB);
}
