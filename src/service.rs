//! Inbound boundary used by the tool screens.
//!
//! ## Design
//! - Callers pass a resolved [`IdentityId`]; tokens stop at the Session Store
//! - A tool debit is keyed by its job, so a retried invocation never charges twice
//! - A debit that cannot be linked to its job is reversed on the spot, or by the sweep
//! - Session changes drive identity upsert, the opportunistic sweep and a balance refresh

use crate::billing::{CheckoutInstructions, PaymentReconciler, Plan, PlanCatalog};
use crate::config::{CheckoutConfig, Config};
use crate::error::{CoreError, CoreResult, StoreError};
use crate::events::{CoreEvent, Notifier};
use crate::jobs::{spawn_session_sweep, JobTracker};
use crate::ledger::{CreditLedger, LedgerReceipt};
use crate::session::SessionChange;
use crate::store::{
    bounded, job_debit_key, CreditStore, IdentityId, Job, JobId, JobState, ReadRetry, SqliteStore,
    Transaction, TransactionId, GUEST_IDENTITY,
};
use crate::tools::ToolId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Answer to a tool invocation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub job_id: JobId,
    pub tool: ToolId,
    /// `false` when the balance could not cover the estimate.
    pub proceed: bool,
    pub transaction_id: Option<TransactionId>,
    pub balance: Option<i64>,
    pub shortfall: Option<u64>,
}

/// What `report_outcome` did with the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub job_id: JobId,
    pub state: JobState,
    /// Credits returned to the account (reversal or partial refund).
    pub refunded: u64,
    /// Extra credits charged when the actual cost exceeded the estimate.
    pub charged: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStatus {
    pub identity: IdentityId,
    pub email: Option<String>,
    pub balance: i64,
    pub plan_id: Option<String>,
    pub plan_name: Option<String>,
    pub valid_until: Option<DateTime<Utc>>,
    pub subscription_active: bool,
}

pub fn refund_key(job: &JobId) -> String {
    format!("refund:{job}")
}

pub fn adjust_key(job: &JobId) -> String {
    format!("adjust:{job}")
}

pub struct CreditService {
    store: Arc<dyn CreditStore>,
    ledger: Arc<CreditLedger>,
    jobs: Arc<JobTracker>,
    reconciler: Arc<PaymentReconciler>,
    catalog: Arc<PlanCatalog>,
    notifier: Notifier,
    checkout: CheckoutConfig,
    timeout: Duration,
    read_retry: ReadRetry,
    stale_after: Duration,
    sweep_on_session_start: bool,
}

impl CreditService {
    /// Open the SQLite store under `config.data_dir` and wire every component.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = SqliteStore::open(&config.credits_db_path(), config.store.busy_timeout())?;
        Self::new(Arc::new(store), config)
    }

    pub fn new(store: Arc<dyn CreditStore>, config: &Config) -> anyhow::Result<Self> {
        let catalog = Arc::new(PlanCatalog::from_config(&config.plans)?);
        let notifier = Notifier::new();
        let timeout = config.store.remote_timeout();
        let ledger = Arc::new(CreditLedger::new(
            Arc::clone(&store),
            notifier.clone(),
            &config.store,
            &config.ledger,
        ));
        let jobs = Arc::new(JobTracker::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            notifier.clone(),
            timeout,
        ));
        let reconciler = Arc::new(PaymentReconciler::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&catalog),
            notifier.clone(),
            timeout,
        ));
        Ok(Self {
            store,
            ledger,
            jobs,
            reconciler,
            catalog,
            notifier,
            checkout: config.checkout.clone(),
            timeout,
            read_retry: ReadRetry::new(config.store.read_retries, config.store.read_backoff()),
            stale_after: config.jobs.stale_after(),
            sweep_on_session_start: config.jobs.sweep_on_session_start,
        })
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.jobs
    }

    pub fn reconciler(&self) -> &Arc<PaymentReconciler> {
        &self.reconciler
    }

    pub fn store(&self) -> &Arc<dyn CreditStore> {
        &self.store
    }

    pub fn plans(&self) -> &[Plan] {
        self.catalog.plans()
    }

    /// Balance changes, job rejections and payment notices.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.notifier.subscribe()
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> CoreResult<T>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        bounded(self.timeout, op, fut).await
    }

    /// Balance of the signed-in identity; zero without a session.
    pub async fn request_balance(&self, identity: Option<&IdentityId>) -> CoreResult<i64> {
        match identity {
            Some(identity) => self.ledger.get_balance(identity).await,
            None => Ok(0),
        }
    }

    /// Open a job for `tool_id` and charge its estimated cost.
    ///
    /// An insufficient balance is not an error: the job is failed, a
    /// [`CoreEvent::JobRejected`] goes out and the answer says not to proceed.
    pub async fn invoke_tool(
        &self,
        identity: &IdentityId,
        tool_id: &str,
        estimated_cost: u64,
    ) -> CoreResult<Invocation> {
        let tool: ToolId = tool_id.parse()?;
        let job = self.jobs.open(identity, tool.as_str()).await?;

        if estimated_cost == 0 {
            return Ok(Invocation {
                job_id: job.id,
                tool,
                proceed: true,
                transaction_id: None,
                balance: None,
                shortfall: None,
            });
        }

        let debit = self
            .ledger
            .debit(
                identity,
                estimated_cost,
                &format!("Tool: {tool}"),
                Some(&job_debit_key(&job.id)),
            )
            .await;

        let receipt = match debit {
            Ok(receipt) => receipt,
            Err(CoreError::InsufficientCredits {
                required,
                available,
                shortfall,
            }) => {
                self.abandon(&job, "insufficient credits").await;
                tracing::info!(
                    identity = %identity,
                    job_id = %job.id,
                    tool = %tool,
                    required,
                    available,
                    shortfall,
                    "Tool invocation rejected"
                );
                self.notifier.notify(CoreEvent::JobRejected {
                    identity: identity.clone(),
                    job_id: job.id.clone(),
                    tool_id: tool.to_string(),
                    shortfall,
                });
                return Ok(Invocation {
                    job_id: job.id,
                    tool,
                    proceed: false,
                    transaction_id: None,
                    balance: Some(available),
                    shortfall: Some(shortfall),
                });
            }
            Err(e) => {
                // The debit may still have landed. The job stays pending so the
                // sweep can find it by key and reverse it.
                tracing::warn!(job_id = %job.id, error = %e, "Tool debit failed");
                return Err(e);
            }
        };

        if let Err(e) = self.jobs.attach_debit(&job.id, &receipt.transaction_id).await {
            tracing::warn!(job_id = %job.id, error = %e, "Could not link debit to job, reversing");
            self.refund_unlinked(&job, &receipt).await;
            return Err(e);
        }

        Ok(Invocation {
            job_id: job.id,
            tool,
            proceed: true,
            transaction_id: Some(receipt.transaction_id),
            balance: Some(receipt.balance),
            shortfall: None,
        })
    }

    async fn abandon(&self, job: &Job, reason: &str) {
        if let Err(e) = self.jobs.fail(&job.id, reason).await {
            tracing::warn!(job_id = %job.id, error = %e, "Could not fail job, leaving it to the sweep");
        }
    }

    async fn refund_unlinked(&self, job: &Job, receipt: &LedgerReceipt) {
        match self.ledger.reverse(&receipt.transaction_id).await {
            Ok(_) | Err(CoreError::AlreadyReversed { .. }) => {
                self.abandon(job, "debit could not be linked").await;
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    transaction_id = %receipt.transaction_id,
                    error = %e,
                    "Reversal failed, leaving it to the sweep"
                );
            }
        }
    }

    /// Settle a job from the tool's report. Duplicate reports, and reports for
    /// jobs the sweep already reaped, change nothing.
    ///
    /// The cost difference of a completed job is keyed by job, so a report
    /// retried after a failed refund or adjustment finishes it instead of
    /// being dropped as a duplicate.
    pub async fn report_outcome(
        &self,
        job_id: &JobId,
        success: bool,
        actual_cost: Option<u64>,
    ) -> CoreResult<Outcome> {
        let job = self.jobs.job(job_id).await?;
        if job.state.is_terminal() {
            let mut outcome = Outcome {
                job_id: job.id.clone(),
                state: job.state,
                refunded: 0,
                charged: 0,
            };
            if let (JobState::Completed, true, Some(actual)) = (job.state, success, actual_cost) {
                let debit = self.jobs.debit_of(&job).await?;
                self.settle_cost(&job, debit.as_ref(), actual, &mut outcome)
                    .await?;
            } else {
                tracing::debug!(job_id = %job_id, state = %job.state, "Outcome for settled job ignored");
            }
            return Ok(outcome);
        }
        let debit = self.jobs.debit_of(&job).await?;

        if !success {
            let mut refunded = 0;
            if let Some(tx) = &debit {
                match self.ledger.reverse(&tx.id).await {
                    Ok(_) => refunded = tx.amount.unsigned_abs(),
                    Err(CoreError::AlreadyReversed { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            let job = self.jobs.fail(job_id, "tool reported failure").await?;
            return Ok(Outcome {
                job_id: job.id,
                state: job.state,
                refunded,
                charged: 0,
            });
        }

        let job = self.jobs.complete(job_id).await?;
        let mut outcome = Outcome {
            job_id: job.id.clone(),
            state: job.state,
            refunded: 0,
            charged: 0,
        };
        if job.state != JobState::Completed {
            return Ok(outcome);
        }
        if let Some(actual) = actual_cost {
            self.settle_cost(&job, debit.as_ref(), actual, &mut outcome)
                .await?;
        }
        Ok(outcome)
    }

    /// Refund or charge the difference between the up-front debit and the
    /// actual cost of a completed job. Only fresh ledger entries are counted.
    async fn settle_cost(
        &self,
        job: &Job,
        debit: Option<&Transaction>,
        actual: u64,
        outcome: &mut Outcome,
    ) -> CoreResult<()> {
        let charged_up_front = debit.map_or(0, |tx| tx.amount.unsigned_abs());
        if actual < charged_up_front {
            let refund = charged_up_front - actual;
            let receipt = self
                .ledger
                .grant(
                    &job.identity,
                    refund,
                    &format!("Refund: {} used {actual} of {charged_up_front}", job.tool_id),
                    &refund_key(&job.id),
                )
                .await?;
            if receipt.is_new() {
                outcome.refunded = refund;
            }
        } else if actual > charged_up_front {
            let extra = actual - charged_up_front;
            match self
                .ledger
                .debit(
                    &job.identity,
                    extra,
                    &format!("Adjustment: {} used {actual} of {charged_up_front}", job.tool_id),
                    Some(&adjust_key(&job.id)),
                )
                .await
            {
                Ok(receipt) if receipt.is_new() => outcome.charged = extra,
                Ok(_) => {}
                Err(CoreError::InsufficientCredits { shortfall, .. }) => {
                    tracing::warn!(
                        identity = %job.identity,
                        job_id = %job.id,
                        extra,
                        shortfall,
                        "Actual cost exceeded balance, adjustment skipped"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Bank-transfer instructions for `plan_id`. Anonymous buyers get the
    /// guest reference; their payment lands in the guest bucket.
    pub fn request_purchase(
        &self,
        identity: Option<&IdentityId>,
        plan_id: &str,
    ) -> CoreResult<CheckoutInstructions> {
        let plan = self
            .catalog
            .find(plan_id.trim())
            .ok_or_else(|| CoreError::UnknownPlan(plan_id.trim().to_string()))?;
        let reference = identity.map_or(GUEST_IDENTITY, IdentityId::as_str);
        Ok(CheckoutInstructions::for_plan(&self.checkout, plan, reference))
    }

    /// Balance plus the current plan subscription.
    pub async fn user_status(&self, identity: &IdentityId) -> CoreResult<UserStatus> {
        let balance = self.ledger.get_balance(identity).await?;
        let (known, subscription) = self
            .read_retry
            .run("user_status", || async {
                let known = self.call("identity", self.store.identity(identity)).await?;
                let subscription = self
                    .call("subscription", self.store.subscription(identity))
                    .await?;
                Ok::<_, CoreError>((known, subscription))
            })
            .await?;

        let now = Utc::now();
        let plan = subscription
            .as_ref()
            .and_then(|s| self.catalog.find(&s.plan_id));
        Ok(UserStatus {
            identity: identity.clone(),
            email: known.and_then(|i| i.email),
            balance,
            plan_id: subscription.as_ref().map(|s| s.plan_id.clone()),
            plan_name: plan.map(|p| p.name.clone()),
            valid_until: subscription.as_ref().map(|s| s.valid_until),
            subscription_active: subscription.as_ref().is_some_and(|s| s.is_active(now)),
        })
    }

    /// React to a session change: record the identity, start the scoped
    /// sweep and refresh the status. Failures are logged, never returned.
    pub async fn on_session_change(&self, change: &SessionChange) -> Option<UserStatus> {
        let identity = change.current.identity()?;

        if let Err(e) = self
            .call("upsert_identity", self.store.upsert_identity(identity))
            .await
        {
            tracing::warn!(identity = %identity.id, error = %e, "Could not record identity");
        }
        if self.sweep_on_session_start && change.signed_in().is_some() {
            spawn_session_sweep(Arc::clone(&self.jobs), identity.id.clone(), self.stale_after);
        }
        match self.user_status(&identity.id).await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(identity = %identity.id, error = %e, "Balance refresh failed");
                None
            }
        }
    }
}

/// Feed session changes into `service` until `cancel` fires or the session
/// store goes away.
pub fn spawn_session_listener(
    service: Arc<CreditService>,
    mut changes: broadcast::Receiver<SessionChange>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                () = cancel.cancelled() => break,
                change = changes.recv() => change,
            };
            match change {
                Ok(change) => {
                    service.on_session_change(&change).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Session listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
