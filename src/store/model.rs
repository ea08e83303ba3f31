use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Stable user identifier issued by the identity provider.
    IdentityId
);
string_id!(TransactionId);
string_id!(JobId);

/// Reserved identity string used by anonymous checkouts.
pub const GUEST_IDENTITY: &str = "guest";

/// Correlation key of the debit charged for a job. The sweeper uses it to find
/// a debit that was written but never linked to its job.
pub fn job_debit_key(job: &JobId) -> String {
    format!("job:{job}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub email: Option<String>,
}

/// Per-identity balance. `version` increments on every applied transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub identity: IdentityId,
    pub balance: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable ledger entry. Positive amounts credit, negative amounts debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account: IdentityId,
    pub amount: i64,
    pub reason: String,
    pub correlation_key: Option<String>,
    /// Set on compensating entries; names the transaction being undone.
    pub reverses: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
}

/// A transaction the ledger wants appended.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub id: TransactionId,
    pub amount: i64,
    pub reason: String,
    pub correlation_key: Option<String>,
    pub reverses: Option<TransactionId>,
}

/// Result of a conditional append.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Appended {
        transaction: Transaction,
        account: Account,
    },
    /// The account version moved, or the balance guard rejected the amount.
    /// Carries the account as the store currently sees it.
    VersionConflict { current: Option<Account> },
    /// A transaction with the same correlation key already exists.
    DuplicateCorrelation(Transaction),
    /// The target transaction already has a compensating entry.
    AlreadyReversed(Transaction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Completed,
    Failed,
    /// Abandoned job claimed by the sweeper; its debit is (or will be) reversed.
    Reaped,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Reaped => "reaped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "reaped" => Some(Self::Reaped),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub identity: IdentityId,
    pub tool_id: String,
    pub state: JobState,
    pub transaction_id: Option<TransactionId>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Recorded, credits not yet settled.
    Received,
    Applied,
    /// Matched no known account; parked until an operator migrates it.
    GuestHeld,
    /// Moved out of the guest bucket onto a real account.
    Migrated,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Applied => "applied",
            Self::GuestHeld => "guest_held",
            Self::Migrated => "migrated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "received" => Some(Self::Received),
            "applied" => Some(Self::Applied),
            "guest_held" => Some(Self::GuestHeld),
            "migrated" => Some(Self::Migrated),
            _ => None,
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(self, Self::Applied | Self::Migrated)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment event as persisted by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRecord {
    pub payment_id: String,
    /// Identity named by the payment processor, verbatim.
    pub claimed_identity: Option<String>,
    /// Account the credits landed on, once settled.
    pub identity: Option<IdentityId>,
    pub plan_id: String,
    pub amount: u64,
    pub currency: String,
    pub delivered_at: DateTime<Utc>,
    pub status: PaymentStatus,
    pub transaction_id: Option<TransactionId>,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Conditional settlement of a recorded payment.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub payment_id: String,
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    pub identity: IdentityId,
    pub transaction_id: TransactionId,
    pub plan_id: String,
    pub duration_months: u32,
    pub note: Option<String>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub identity: IdentityId,
    pub plan_id: String,
    pub valid_until: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.valid_until > now
    }
}
