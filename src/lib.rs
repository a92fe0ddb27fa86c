// Tax Ledger Reconciliation Engine - Core Library
// Exposes all modules for use in the CLI, schedulers, API layers, and tests

pub mod db;
pub mod directory; // member roster -> payer account sync
pub mod engine; // TaxEngine facade: triggers, reviews, admin
pub mod entities; // owners, accounts, payments, members, history
pub mod error;
pub mod importer; // ledger feed -> payments
pub mod payday; // periodic debit sweep
pub mod payments; // payment state machine
pub mod providers; // upstream data traits + CSV adapters
pub mod queries; // viewer-scoped reads + statistics
pub mod resolver; // id -> name with cache
pub mod rules; // rule groups and auto-approval

// Re-export commonly used types
pub use db::{setup_database, LedgerEntry};
pub use directory::SyncOutcome;
pub use engine::{OpReport, TaxEngine};
pub use entities::{
    AccountRepository, AccountStatus, AdminAction, AdminEntry, HistoryRepository, Member,
    MemberRepository, MemberStatus, NewPayment, Owner, OwnerKind, OwnerRepository, PayerAccount,
    Payment, PaymentAction, PaymentEntry, PaymentRepository, PaymentStatus, Reviser,
    UpdateSection,
};
pub use error::{Error, ErrorKind, Result};
pub use importer::ImportOutcome;
pub use payday::{has_paid, PaydayOutcome};
pub use providers::{
    CsvLedgerFile, CsvNameFile, CsvPersonaFile, CsvRosterFile, IdentityLookup, LedgerFeed,
    PersonRecord, PersonaSetProvider, RosterMember, RosterProvider,
};
pub use queries::{AccessScope, Actor, OwnerStatistics};
pub use rules::{Criterion, Filter, FilterSet, FilterSetRepository, RuleOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
