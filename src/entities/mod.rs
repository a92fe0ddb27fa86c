// Entity models and their repositories.
//
// Each entity pairs a plain data struct with a repository that owns the SQL
// for it. Ownership is explicit: account and payment rows carry their owner
// id, and the repositories enforce the uniqueness invariants at the boundary
// instead of leaning on database cascades.

pub mod account;
pub mod history;
pub mod member;
pub mod owner;
pub mod payment;

pub use account::{AccountRepository, AccountStatus, PayerAccount};
pub use history::{
    AdminAction, AdminEntry, HistoryRepository, PaymentAction, PaymentEntry,
};
pub use member::{Member, MemberRepository, MemberStatus};
pub use owner::{Owner, OwnerKind, OwnerRepository, UpdateSection};
pub use payment::{NewPayment, Payment, PaymentRepository, PaymentStatus, Reviser};
