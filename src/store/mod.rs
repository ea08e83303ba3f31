//! Shared persistence behind the credit core.
//!
//! Every client (browser tab, CLI, webhook gateway) talks to the same store.
//! Balance mutations are conditional on the account version, so concurrent
//! writers never lose an update: the loser sees [`AppendOutcome::VersionConflict`]
//! and retries against the fresh state.

mod model;
pub mod sqlite;

pub use model::{
    Account, AppendOutcome, Identity, IdentityId, Job, JobId, JobState, NewTransaction,
    PaymentRecord, PaymentStatus, Settlement, Subscription, Transaction, TransactionId,
    job_debit_key, GUEST_IDENTITY,
};
pub use sqlite::SqliteStore;

use crate::error::{CoreError, CoreResult, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

/// Storage operations used by the ledger, job tracker and reconciler.
#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Cheap round trip used by health checks.
    async fn ping(&self) -> Result<(), StoreError>;

    // ── Identities ───────────────────────────────────────────────

    /// Insert the identity, or backfill its email if none is stored yet.
    async fn upsert_identity(&self, identity: &Identity) -> Result<Identity, StoreError>;
    async fn identity(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError>;

    // ── Accounts & transactions ──────────────────────────────────

    async fn account(&self, id: &IdentityId) -> Result<Option<Account>, StoreError>;
    /// Create a zero-balance account if absent and return the current row.
    async fn ensure_account(&self, id: &IdentityId) -> Result<Account, StoreError>;
    /// Append `tx` and apply it to the balance, provided the account is still
    /// at `expected_version` and the balance stays non-negative.
    async fn append(
        &self,
        account: &IdentityId,
        expected_version: i64,
        tx: NewTransaction,
    ) -> Result<AppendOutcome, StoreError>;
    async fn transaction(&self, id: &TransactionId) -> Result<Option<Transaction>, StoreError>;
    async fn transaction_by_key(&self, key: &str) -> Result<Option<Transaction>, StoreError>;
    /// The compensating entry for `id`, if one exists.
    async fn reversal_of(&self, id: &TransactionId) -> Result<Option<Transaction>, StoreError>;
    /// Most recent first.
    async fn transactions(
        &self,
        account: &IdentityId,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError>;
    async fn transaction_sum(&self, account: &IdentityId) -> Result<i64, StoreError>;

    // ── Jobs ─────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn job(&self, id: &JobId) -> Result<Option<Job>, StoreError>;
    /// Link a debit to a pending job that has none yet. Returns whether it stuck.
    async fn attach_debit(&self, id: &JobId, tx: &TransactionId) -> Result<bool, StoreError>;
    async fn touch_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool, StoreError>;
    /// Move a pending job to a terminal state. Returns `false` when the job was
    /// no longer pending.
    async fn finish_job(
        &self,
        id: &JobId,
        state: JobState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Pending jobs whose last heartbeat is older than `cutoff`.
    async fn stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
        scope: Option<&IdentityId>,
    ) -> Result<Vec<Job>, StoreError>;
    /// Reaped jobs whose debit has no compensating entry yet.
    async fn unsettled_reaped_jobs(
        &self,
        scope: Option<&IdentityId>,
    ) -> Result<Vec<Job>, StoreError>;
    /// Delete terminal jobs last updated before `cutoff`.
    async fn purge_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // ── Payments & subscriptions ─────────────────────────────────

    /// Insert the payment unless its id is already recorded. Returns whether
    /// a new row was written.
    async fn record_payment(&self, payment: &PaymentRecord) -> Result<bool, StoreError>;
    async fn payment(&self, payment_id: &str) -> Result<Option<PaymentRecord>, StoreError>;
    async fn payments_with_status(
        &self,
        status: PaymentStatus,
    ) -> Result<Vec<PaymentRecord>, StoreError>;
    /// Atomically move a payment from `settlement.from` to `settlement.to` and
    /// extend the identity's subscription. Returns `None` when the payment was
    /// not in the expected state, so the extension happens at most once.
    async fn settle_payment(
        &self,
        settlement: Settlement,
    ) -> Result<Option<Subscription>, StoreError>;
    async fn subscription(&self, id: &IdentityId) -> Result<Option<Subscription>, StoreError>;
}

/// Run one store call under `limit`, classifying a timeout as unreachable.
pub(crate) async fn bounded<T, F>(limit: Duration, op: &'static str, fut: F) -> CoreResult<T>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(CoreError::from),
        Err(_) => Err(CoreError::Unreachable(format!(
            "{op} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Retry policy for idempotent reads against a store that may be unreachable.
#[derive(Debug, Clone, Copy)]
pub struct ReadRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl ReadRetry {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Call `f` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. Backoff doubles after each unreachable result.
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match f().await {
                Err(CoreError::Unreachable(msg)) if attempt < self.attempts => {
                    tracing::warn!(op, attempt, error = %msg, "Store unreachable, retrying read");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn bounded_maps_timeout_to_unreachable() {
        let result: CoreResult<()> = bounded(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CoreError::Unreachable(_))));
    }

    #[tokio::test]
    async fn read_retry_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let retry = ReadRetry::new(3, Duration::from_millis(1));
        let value = retry
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoreError::Unreachable("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn read_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let retry = ReadRetry::new(2, Duration::from_millis(1));
        let result: CoreResult<()> = retry
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::Unreachable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(CoreError::Unreachable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_retry_does_not_repeat_permanent_errors() {
        let calls = AtomicU32::new(0);
        let retry = ReadRetry::new(5, Duration::from_millis(1));
        let result: CoreResult<()> = retry
            .run("missing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::not_found("account", "x"))
            })
            .await;
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
