//! Job Tracker: in-flight units of paid work and their recovery.
//!
//! A job is `pending` until the caller reports an outcome. Jobs whose client
//! disappears stay pending; the sweep claims them (`pending -> reaped` is a
//! check-and-set, so only one sweeper wins) and then reverses their debit.
//! A claimed job whose reversal failed is retried on every later sweep.

pub mod sweeper;

pub use sweeper::{spawn_session_sweep, spawn_sweeper};

use crate::error::{AuthFailure, CoreError, CoreResult, StoreError};
use crate::events::{CoreEvent, Notifier};
use crate::ledger::CreditLedger;
use crate::store::{
    bounded, job_debit_key, CreditStore, IdentityId, Job, JobId, JobState, Transaction,
    TransactionId, GUEST_IDENTITY,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Stale pending jobs found.
    pub examined: usize,
    /// Jobs this pass moved to `reaped`.
    pub reaped: usize,
    /// Debits reversed by this pass (including retries of earlier claims).
    pub reversed: usize,
    pub credits_restored: i64,
    /// Jobs another client finished or claimed first.
    pub skipped: usize,
    /// Reversals that failed and will be retried next time.
    pub failed: usize,
}

pub struct JobTracker {
    store: Arc<dyn CreditStore>,
    ledger: Arc<CreditLedger>,
    notifier: Notifier,
    timeout: Duration,
}

impl JobTracker {
    pub fn new(
        store: Arc<dyn CreditStore>,
        ledger: Arc<CreditLedger>,
        notifier: Notifier,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
            timeout,
        }
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> CoreResult<T>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        bounded(self.timeout, op, fut).await
    }

    /// Create a pending job for `identity`.
    pub async fn open(&self, identity: &IdentityId, tool_id: &str) -> CoreResult<Job> {
        let raw = identity.as_str().trim();
        if raw.is_empty() || raw == GUEST_IDENTITY {
            return Err(AuthFailure::NotSignedIn.into());
        }
        let now = Utc::now();
        let job = Job {
            id: JobId::generate(),
            identity: identity.clone(),
            tool_id: tool_id.to_string(),
            state: JobState::Pending,
            transaction_id: None,
            failure_reason: None,
            created_at: now,
            heartbeat_at: now,
            updated_at: now,
        };
        self.call("insert_job", self.store.insert_job(&job)).await?;
        tracing::debug!(job_id = %job.id, identity = %identity, tool = tool_id, "Job opened");
        Ok(job)
    }

    pub async fn job(&self, id: &JobId) -> CoreResult<Job> {
        self.call("job", self.store.job(id))
            .await?
            .ok_or_else(|| CoreError::not_found("job", id.as_str()))
    }

    /// Record which transaction paid for the job. Re-attaching the same
    /// transaction is a no-op.
    pub async fn attach_debit(&self, id: &JobId, transaction_id: &TransactionId) -> CoreResult<()> {
        if self
            .call("attach_debit", self.store.attach_debit(id, transaction_id))
            .await?
        {
            return Ok(());
        }
        let job = self.job(id).await?;
        match &job.transaction_id {
            Some(existing) if existing == transaction_id => Ok(()),
            Some(_) => Err(CoreError::DebitAlreadyAttached {
                job_id: id.to_string(),
            }),
            None => Err(CoreError::JobSettled {
                job_id: id.to_string(),
                state: job.state.to_string(),
            }),
        }
    }

    /// Mark the job completed. Already-terminal jobs are returned unchanged.
    pub async fn complete(&self, id: &JobId) -> CoreResult<Job> {
        self.finish(id, JobState::Completed, None).await
    }

    /// Mark the job failed. Already-terminal jobs are returned unchanged.
    pub async fn fail(&self, id: &JobId, reason: &str) -> CoreResult<Job> {
        self.finish(id, JobState::Failed, Some(reason)).await
    }

    async fn finish(&self, id: &JobId, state: JobState, reason: Option<&str>) -> CoreResult<Job> {
        let moved = self
            .call("finish_job", self.store.finish_job(id, state, reason, Utc::now()))
            .await?;
        let job = self.job(id).await?;
        if moved {
            tracing::debug!(job_id = %id, state = %state, "Job finished");
        } else if job.state != state {
            tracing::debug!(job_id = %id, current = %job.state, requested = %state, "Job already terminal");
        }
        Ok(job)
    }

    /// Refresh the heartbeat of a pending job. Returns `false` once the job is
    /// terminal.
    pub async fn touch(&self, id: &JobId) -> CoreResult<bool> {
        self.call("touch_job", self.store.touch_job(id, Utc::now()))
            .await
    }

    /// The debit that paid for `job`, linked or not.
    pub async fn debit_of(&self, job: &Job) -> CoreResult<Option<Transaction>> {
        if let Some(id) = &job.transaction_id {
            return self.ledger.transaction(id).await;
        }
        self.ledger.transaction_by_key(&job_debit_key(&job.id)).await
    }

    /// Reap pending jobs without a heartbeat for `older_than` and reverse
    /// their debits. `scope` limits the pass to one identity.
    pub async fn sweep_stale(
        &self,
        older_than: Duration,
        scope: Option<&IdentityId>,
    ) -> CoreResult<SweepReport> {
        let now = Utc::now();
        let cutoff = cutoff_before(now, older_than);
        let stale = self
            .call("stale_jobs", self.store.stale_jobs(cutoff, scope))
            .await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };
        let mut attempted = HashSet::new();

        for job in stale {
            let claimed = self
                .call(
                    "finish_job",
                    self.store.finish_job(
                        &job.id,
                        JobState::Reaped,
                        Some("abandoned: no heartbeat before the staleness threshold"),
                        now,
                    ),
                )
                .await?;
            if !claimed {
                report.skipped += 1;
                continue;
            }
            report.reaped += 1;
            tracing::info!(
                job_id = %job.id,
                identity = %job.identity,
                tool = %job.tool_id,
                "Reaped stale job"
            );
            self.notifier.notify(CoreEvent::JobReaped {
                identity: job.identity.clone(),
                job_id: job.id.clone(),
            });
            attempted.insert(job.id.clone());
            self.settle(&job, &mut report).await;
        }

        let unsettled = self
            .call("unsettled_reaped_jobs", self.store.unsettled_reaped_jobs(scope))
            .await?;
        for job in unsettled {
            if attempted.insert(job.id.clone()) {
                self.settle(&job, &mut report).await;
            }
        }

        if report.reaped > 0 || report.reversed > 0 || report.failed > 0 {
            tracing::info!(
                reaped = report.reaped,
                reversed = report.reversed,
                credits = report.credits_restored,
                failed = report.failed,
                "Stale job sweep finished"
            );
        }
        Ok(report)
    }

    /// Reverse a reaped job's debit, if it has one and nobody else did.
    async fn settle(&self, job: &Job, report: &mut SweepReport) {
        let debit = match self.debit_of(job).await {
            Ok(Some(debit)) => debit,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Could not load debit of reaped job");
                report.failed += 1;
                return;
            }
        };
        match self.ledger.reverse(&debit.id).await {
            Ok(receipt) => {
                report.reversed += 1;
                report.credits_restored += -debit.amount;
                tracing::info!(
                    job_id = %job.id,
                    transaction_id = %receipt.transaction_id,
                    balance = receipt.balance,
                    "Restored credits of abandoned job"
                );
            }
            Err(CoreError::AlreadyReversed { .. }) => {}
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    transaction_id = %debit.id,
                    error = %e,
                    "Reversal of reaped job failed, will retry"
                );
                report.failed += 1;
            }
        }
    }

    /// Delete terminal jobs last updated more than `older_than` ago.
    pub async fn purge(&self, older_than: Duration) -> CoreResult<u64> {
        let cutoff = cutoff_before(Utc::now(), older_than);
        let purged = self.call("purge_jobs", self.store.purge_jobs(cutoff)).await?;
        if purged > 0 {
            tracing::debug!(purged, "Purged terminal jobs");
        }
        Ok(purged)
    }
}

fn cutoff_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LedgerConfig, StoreConfig};
    use crate::store::SqliteStore;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        ledger: Arc<CreditLedger>,
        tracker: JobTracker,
    }

    fn tracker_on(path: &std::path::Path) -> (Arc<CreditLedger>, JobTracker) {
        let store: Arc<dyn CreditStore> =
            Arc::new(SqliteStore::open(path, Duration::from_secs(5)).unwrap());
        let notifier = Notifier::new();
        let ledger = Arc::new(CreditLedger::new(
            Arc::clone(&store),
            notifier.clone(),
            &StoreConfig::default(),
            &LedgerConfig {
                welcome_grant: 0,
                max_conflict_retries: 10,
            },
        ));
        let tracker = JobTracker::new(store, Arc::clone(&ledger), notifier, Duration::from_secs(5));
        (ledger, tracker)
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let (ledger, tracker) = tracker_on(&tmp.path().join("credits.db"));
        Fixture {
            _tmp: tmp,
            ledger,
            tracker,
        }
    }

    #[tokio::test]
    async fn open_rejects_guest_identity() {
        let f = fixture();
        let err = f
            .tracker
            .open(&IdentityId::from(GUEST_IDENTITY), "slide_master")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Auth(AuthFailure::NotSignedIn)));
    }

    #[tokio::test]
    async fn duplicate_completion_is_a_no_op() {
        let f = fixture();
        let job = f.tracker.open(&IdentityId::from("alice"), "slide_master").await.unwrap();
        assert_eq!(f.tracker.complete(&job.id).await.unwrap().state, JobState::Completed);
        assert_eq!(f.tracker.complete(&job.id).await.unwrap().state, JobState::Completed);
        let after_fail = f.tracker.fail(&job.id, "late error").await.unwrap();
        assert_eq!(after_fail.state, JobState::Completed);
        assert_eq!(after_fail.failure_reason, None);
    }

    #[tokio::test]
    async fn only_one_debit_per_job() {
        let f = fixture();
        let alice = IdentityId::from("alice");
        f.ledger.grant(&alice, 100, "seed", "seed").await.unwrap();
        let job = f.tracker.open(&alice, "trend_scout").await.unwrap();
        let d1 = f.ledger.debit(&alice, 10, "a", None).await.unwrap();
        let d2 = f.ledger.debit(&alice, 10, "b", None).await.unwrap();

        f.tracker.attach_debit(&job.id, &d1.transaction_id).await.unwrap();
        f.tracker.attach_debit(&job.id, &d1.transaction_id).await.unwrap();
        let err = f.tracker.attach_debit(&job.id, &d2.transaction_id).await.unwrap_err();
        assert!(matches!(err, CoreError::DebitAlreadyAttached { .. }));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let f = fixture();
        let err = f.tracker.complete(&JobId::from("nope")).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: "job", .. }));
    }

    #[tokio::test]
    async fn stale_job_is_reaped_and_refunded() {
        let f = fixture();
        let alice = IdentityId::from("alice");
        f.ledger.grant(&alice, 500, "seed", "seed").await.unwrap();
        let job = f.tracker.open(&alice, "slide_master").await.unwrap();
        let debit = f
            .ledger
            .debit(&alice, 50, "slide_master", Some(&job_debit_key(&job.id)))
            .await
            .unwrap();
        f.tracker.attach_debit(&job.id, &debit.transaction_id).await.unwrap();
        assert_eq!(f.ledger.get_balance(&alice).await.unwrap(), 450);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = f
            .tracker
            .sweep_stale(Duration::from_millis(5), None)
            .await
            .unwrap();
        assert_eq!(report.reaped, 1);
        assert_eq!(report.reversed, 1);
        assert_eq!(report.credits_restored, 50);
        assert_eq!(f.tracker.job(&job.id).await.unwrap().state, JobState::Reaped);
        assert_eq!(f.ledger.get_balance(&alice).await.unwrap(), 500);

        let again = f
            .tracker
            .sweep_stale(Duration::from_millis(5), None)
            .await
            .unwrap();
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn fresh_and_touched_jobs_survive_the_sweep() {
        let f = fixture();
        let alice = IdentityId::from("alice");
        let job = f.tracker.open(&alice, "slide_master").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(f.tracker.touch(&job.id).await.unwrap());

        let report = f
            .tracker
            .sweep_stale(Duration::from_millis(20), None)
            .await
            .unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(f.tracker.job(&job.id).await.unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn unlinked_debit_is_still_reversed() {
        let f = fixture();
        let alice = IdentityId::from("alice");
        f.ledger.grant(&alice, 200, "seed", "seed").await.unwrap();
        let job = f.tracker.open(&alice, "youtube_insight").await.unwrap();
        // Client crashed between the debit and the attach.
        f.ledger
            .debit(&alice, 30, "youtube_insight", Some(&job_debit_key(&job.id)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = f
            .tracker
            .sweep_stale(Duration::from_millis(5), Some(&alice))
            .await
            .unwrap();
        assert_eq!(report.reversed, 1);
        assert_eq!(f.ledger.get_balance(&alice).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn scoped_sweep_leaves_other_identities_alone() {
        let f = fixture();
        let alice = IdentityId::from("alice");
        let bob = IdentityId::from("bob");
        f.tracker.open(&alice, "a").await.unwrap();
        let bobs = f.tracker.open(&bob, "b").await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = f
            .tracker
            .sweep_stale(Duration::from_millis(5), Some(&alice))
            .await
            .unwrap();
        assert_eq!(report.reaped, 1);
        assert_eq!(f.tracker.job(&bobs.id).await.unwrap().state, JobState::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sweeps_reverse_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("credits.db");
        let (ledger, tab_a) = tracker_on(&path);
        let (_, tab_b) = tracker_on(&path);
        let (tab_a, tab_b) = (Arc::new(tab_a), Arc::new(tab_b));
        let alice = IdentityId::from("alice");

        ledger.grant(&alice, 500, "seed", "seed").await.unwrap();
        let before = ledger.get_balance(&alice).await.unwrap();
        for _ in 0..5 {
            let job = tab_a.open(&alice, "slide_master").await.unwrap();
            let debit = ledger
                .debit(&alice, 20, "slide_master", Some(&job_debit_key(&job.id)))
                .await
                .unwrap();
            tab_a.attach_debit(&job.id, &debit.transaction_id).await.unwrap();
        }
        assert_eq!(ledger.get_balance(&alice).await.unwrap(), before - 100);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let threshold = Duration::from_millis(5);
        let a = {
            let tracker = Arc::clone(&tab_a);
            tokio::spawn(async move { tracker.sweep_stale(threshold, None).await })
        };
        let b = {
            let tracker = Arc::clone(&tab_b);
            tokio::spawn(async move { tracker.sweep_stale(threshold, None).await })
        };
        let (ra, rb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        assert_eq!(ra.reaped + rb.reaped, 5);
        assert_eq!(ra.reversed + rb.reversed, 5);
        assert_eq!(ledger.get_balance(&alice).await.unwrap(), before);
        assert!(ledger.reconcile(&alice).await.unwrap().consistent);
    }

    #[tokio::test]
    async fn purge_keeps_pending_jobs() {
        let f = fixture();
        let alice = IdentityId::from("alice");
        let done = f.tracker.open(&alice, "a").await.unwrap();
        let running = f.tracker.open(&alice, "b").await.unwrap();
        f.tracker.complete(&done.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.tracker.purge(Duration::from_millis(5)).await.unwrap(), 1);
        assert!(f.tracker.job(&running.id).await.is_ok());
    }
}
