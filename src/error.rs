//! Error taxonomy for the credit core.
//!
//! Storage failures are kept separate (`StoreError`) from the business-level
//! classification (`CoreError`) that callers act on. A duplicate correlation
//! key on the same account is not an error: it resolves to a receipt with
//! [`crate::ledger::Applied::AlreadyProcessed`].

use serde::Serialize;

/// Failure inside a [`crate::store::CreditStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),
    /// The database was locked by another client for longer than the busy timeout.
    #[error("store busy: {0}")]
    Busy(String),
    /// The blocking worker running the statement panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Classify a raw SQLite error, separating lock contention from real faults.
    pub fn classify(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref inner, _)
                if matches!(
                    inner.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::Busy(err.to_string())
            }
            other => Self::Sqlite(other),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::classify(err)
    }
}

/// Authentication failures surfaced by the Session Store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("an account already exists for {0}")]
    AccountExists(String),
    #[error("identity provider error: {0}")]
    ProviderError(String),
    #[error("session expired")]
    SessionExpired,
    #[error("not signed in")]
    NotSignedIn,
}

/// Coarse classification used by the UI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthFailure,
    InsufficientCredits,
    Conflict,
    NotFound,
    Unreachable,
    Invalid,
    Internal,
}

/// Errors returned by the ledger, job tracker, reconciler and service facade.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Auth(#[from] AuthFailure),

    #[error("insufficient credits: required {required}, available {available} (short by {shortfall})")]
    InsufficientCredits {
        required: u64,
        available: i64,
        shortfall: u64,
    },

    #[error("ledger write conflicted {attempts} times, try again")]
    Conflict { attempts: u32 },

    #[error("transaction {transaction_id} was already reversed")]
    AlreadyReversed { transaction_id: String },

    #[error("transaction {transaction_id} is a compensation and cannot be reversed")]
    NotReversible { transaction_id: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    #[error("payment {payment_id} could not be matched to an account and was held in the guest bucket")]
    UnknownIdentity { payment_id: String },

    #[error("correlation key {key} already belongs to account {owner}")]
    KeyOwnedByOtherAccount { key: String, owner: String },

    #[error("job {job_id} is already {state}")]
    JobSettled { job_id: String, state: String },

    #[error("job {job_id} already has a debit attached")]
    DebitAlreadyAttached { job_id: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("remote store unreachable: {0}")]
    Unreachable(String),

    #[error("storage failure: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Busy(msg) => Self::Unreachable(msg),
            other => Self::Storage(other),
        }
    }
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Map onto the taxonomy the UI reacts to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::AuthFailure,
            Self::InsufficientCredits { .. } => ErrorKind::InsufficientCredits,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } | Self::UnknownPlan(_) | Self::UnknownTool(_) => {
                ErrorKind::NotFound
            }
            Self::UnknownIdentity { .. } => ErrorKind::NotFound,
            Self::Unreachable(_) => ErrorKind::Unreachable,
            Self::AlreadyReversed { .. }
            | Self::NotReversible { .. }
            | Self::JobSettled { .. }
            | Self::DebitAlreadyAttached { .. }
            | Self::KeyOwnedByOtherAccount { .. }
            | Self::InvalidAmount(_)
            | Self::InvalidRequest(_) => ErrorKind::Invalid,
            Self::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Worth retrying later without any change in input.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unreachable(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_store_errors_become_unreachable() {
        let err: CoreError = StoreError::Busy("database is locked".into()).into();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert!(err.is_transient());
    }

    #[test]
    fn corrupt_rows_are_internal() {
        let err: CoreError = StoreError::Corrupt("bad state".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.is_transient());
    }

    #[test]
    fn insufficient_credits_message_carries_shortfall() {
        let err = CoreError::InsufficientCredits {
            required: 150,
            available: 100,
            shortfall: 50,
        };
        assert_eq!(err.kind(), ErrorKind::InsufficientCredits);
        assert!(err.to_string().contains("short by 50"));
    }

    #[test]
    fn auth_failures_convert() {
        let err: CoreError = AuthFailure::InvalidCredentials.into();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
    }

    #[test]
    fn sqlite_lock_is_classified_busy() {
        let raw = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(matches!(StoreError::classify(raw), StoreError::Busy(_)));
    }
}
