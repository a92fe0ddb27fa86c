// Error taxonomy for the reconciliation engine.
//
// Business outcomes (not found, permission denied, invalid transition,
// immutable record, conflict) travel as values back to the caller and are
// rendered through `user_message()`. Infrastructure faults (storage,
// serialization, provider transport) are logged with context and shown to
// users only as a generic message.

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("actor '{actor}' has no authority over owner {owner_id}")]
    PermissionDenied { actor: String, owner_id: i64 },

    #[error("cannot {action} a payment in state '{state}'")]
    InvalidTransition { action: &'static str, state: String },

    #[error("payments with an external entry id are immutable")]
    ImmutableRecord,

    /// The underlying atomic unit failed to commit (busy/locked database).
    /// Entry points retry this once before surfacing it.
    #[error("transaction failed to commit")]
    TransactionConflict,

    #[error("{entity} already exists")]
    AlreadyExists { entity: &'static str },

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("storage failure: {0}")]
    Storage(rusqlite::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider failure: {0}")]
    Provider(#[from] anyhow::Error),
}

/// Coarse classification carried on structured results so the API layer can
/// translate outcomes without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InvalidTransition,
    ImmutableRecord,
    TransactionConflict,
    AlreadyExists,
    Validation,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::ImmutableRecord => ErrorKind::ImmutableRecord,
            Error::TransactionConflict => ErrorKind::TransactionConflict,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Storage(_) | Error::Serialization(_) | Error::Provider(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Short message safe to show a user verbatim. Infrastructure faults are
    /// collapsed so internals never leak to the caller.
    pub fn user_message(&self) -> String {
        match self {
            Error::NotFound { entity, .. } => format!("{} not found.", entity),
            Error::PermissionDenied { .. } => "Permission denied.".to_string(),
            Error::InvalidTransition { action, state } => {
                format!("Cannot {} a payment that is {}.", action, state)
            }
            Error::ImmutableRecord => "Imported payments cannot be deleted.".to_string(),
            Error::TransactionConflict => "Transaction failed. Please try again.".to_string(),
            Error::AlreadyExists { entity } => format!("{} already exists.", entity),
            Error::Validation { field, reason } => format!("Invalid {}: {}.", field, reason),
            Error::Storage(_) | Error::Serialization(_) | Error::Provider(_) => {
                "Internal error. Please contact an administrator.".to_string()
            }
        }
    }

    /// True for the retry-once class of failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::TransactionConflict)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                Error::TransactionConflict
            }
            _ => Error::Storage(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = Error::NotFound {
            entity: "Payment",
            id: 7,
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::ImmutableRecord;
        assert_eq!(err.kind(), ErrorKind::ImmutableRecord);

        let err = Error::Storage(rusqlite::Error::InvalidQuery);
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_busy_maps_to_conflict() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let err: Error = busy.into();
        assert!(err.is_conflict());
        assert_eq!(err.kind(), ErrorKind::TransactionConflict);
    }

    #[test]
    fn test_constraint_violation_stays_storage() {
        // Uniqueness races are handled at the repository boundary, not by the
        // blanket conversion.
        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        let err: Error = constraint.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_user_messages_hide_internals() {
        let err = Error::Storage(rusqlite::Error::InvalidQuery);
        assert_eq!(
            err.user_message(),
            "Internal error. Please contact an administrator."
        );

        let err = Error::NotFound {
            entity: "Owner",
            id: 3,
        };
        assert_eq!(err.user_message(), "Owner not found.");

        let err = Error::InvalidTransition {
            action: "approve",
            state: "approved".to_string(),
        };
        assert_eq!(err.user_message(), "Cannot approve a payment that is approved.");
    }
}
