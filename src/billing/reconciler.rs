//! Payment Reconciler: turns payment confirmations into ledger grants.
//!
//! The payment id is both the primary key of the payment record and the
//! correlation key of the grant, so redelivered confirmations are no-ops.
//! Payments that cannot be matched to a known account are parked in the guest
//! bucket and only leave it through [`PaymentReconciler::claim_guest_payment`].

use super::plans::{Plan, PlanCatalog};
use crate::error::{CoreError, CoreResult, StoreError};
use crate::events::{CoreEvent, Notifier};
use crate::ledger::{Applied, CreditLedger, LedgerReceipt};
use crate::store::{
    bounded, CreditStore, IdentityId, PaymentRecord, PaymentStatus, Settlement, Subscription,
    GUEST_IDENTITY,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// External notification that a plan was paid for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Processor-assigned id; the idempotency key.
    pub payment_id: String,
    /// Identity named by the payer. Absent or `"guest"` for anonymous checkouts.
    #[serde(default)]
    pub identity: Option<String>,
    /// Empty when the processor only reports an amount; the plan is then
    /// matched by price.
    #[serde(default)]
    pub plan_id: String,
    pub amount: u64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default = "chrono::Utc::now")]
    pub delivered_at: DateTime<Utc>,
}

/// User-displayable result of applying a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentConfirmation {
    pub payment_id: String,
    pub identity: IdentityId,
    pub plan_id: String,
    pub credits: u64,
    /// Ledger reference of the grant.
    pub transaction_id: String,
    pub balance: i64,
    pub applied: Applied,
    pub valid_until: Option<DateTime<Utc>>,
}

impl PaymentConfirmation {
    pub fn message(&self) -> String {
        match self.applied {
            Applied::New => format!(
                "Added {} credits ({}). Reference: {}",
                self.credits, self.plan_id, self.transaction_id
            ),
            Applied::AlreadyProcessed => format!(
                "Payment {} was already applied. Reference: {}",
                self.payment_id, self.transaction_id
            ),
        }
    }
}

pub struct PaymentReconciler {
    store: Arc<dyn CreditStore>,
    ledger: Arc<CreditLedger>,
    catalog: Arc<PlanCatalog>,
    notifier: Notifier,
    timeout: Duration,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<dyn CreditStore>,
        ledger: Arc<CreditLedger>,
        catalog: Arc<PlanCatalog>,
        notifier: Notifier,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            catalog,
            notifier,
            timeout,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> CoreResult<T>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        bounded(self.timeout, op, fut).await
    }

    fn plan_for(&self, event: &PaymentEvent) -> CoreResult<Plan> {
        let plan = if event.plan_id.trim().is_empty() {
            self.catalog.find_by_price(event.amount)
        } else {
            self.catalog.find(event.plan_id.trim())
        };
        let plan = plan.cloned().ok_or_else(|| {
            CoreError::UnknownPlan(if event.plan_id.is_empty() {
                format!("no plan priced {}", event.amount)
            } else {
                event.plan_id.clone()
            })
        })?;
        if plan.price != event.amount {
            tracing::warn!(
                payment_id = %event.payment_id,
                plan = %plan.id,
                expected = plan.price,
                paid = event.amount,
                "Payment amount differs from plan price"
            );
        }
        Ok(plan)
    }

    /// An identity is resolvable when it is not the guest placeholder and the
    /// core has seen it before (signed in or holding an account).
    async fn resolve(&self, claimed: Option<&str>) -> CoreResult<Option<IdentityId>> {
        let Some(raw) = claimed.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(None);
        };
        if raw == GUEST_IDENTITY {
            return Ok(None);
        }
        let id = IdentityId::from(raw);
        if self.call("identity", self.store.identity(&id)).await?.is_some()
            || self.call("account", self.store.account(&id)).await?.is_some()
        {
            return Ok(Some(id));
        }
        Ok(None)
    }

    /// Apply a payment confirmation exactly once.
    pub async fn apply(&self, event: &PaymentEvent) -> CoreResult<PaymentConfirmation> {
        if event.payment_id.trim().is_empty() {
            return Err(CoreError::InvalidRequest("payment id is empty".into()));
        }
        if let Some(existing) = self
            .call("payment", self.store.payment(&event.payment_id))
            .await?
        {
            match existing.status {
                PaymentStatus::Applied | PaymentStatus::Migrated => {
                    return self.replayed(&existing).await;
                }
                PaymentStatus::GuestHeld => {
                    return Err(CoreError::UnknownIdentity {
                        payment_id: event.payment_id.clone(),
                    });
                }
                // Recorded by an earlier delivery that did not finish.
                PaymentStatus::Received => {}
            }
        }
        let plan = self.plan_for(event)?;

        let Some(identity) = self.resolve(event.identity.as_deref()).await? else {
            self.hold(event, &plan).await?;
            return Err(CoreError::UnknownIdentity {
                payment_id: event.payment_id.clone(),
            });
        };

        let now = Utc::now();
        self.call(
            "record_payment",
            self.store.record_payment(&PaymentRecord {
                payment_id: event.payment_id.clone(),
                claimed_identity: event.identity.clone(),
                identity: None,
                plan_id: plan.id.clone(),
                amount: event.amount,
                currency: event.currency.clone().unwrap_or_else(|| plan.currency.clone()),
                delivered_at: event.delivered_at,
                status: PaymentStatus::Received,
                transaction_id: None,
                note: None,
                recorded_at: now,
            }),
        )
        .await?;

        let receipt = self
            .ledger
            .grant(
                &identity,
                plan.credits,
                &format!("{} plan purchase ({})", plan.name, event.payment_id),
                &event.payment_id,
            )
            .await?;
        let subscription = self
            .settle(
                &event.payment_id,
                PaymentStatus::Received,
                PaymentStatus::Applied,
                &identity,
                &plan,
                &receipt,
                None,
            )
            .await?;

        if receipt.is_new() {
            tracing::info!(
                payment_id = %event.payment_id,
                identity = %identity,
                plan = %plan.id,
                credits = plan.credits,
                "Payment applied"
            );
            self.notifier.notify(CoreEvent::PaymentApplied {
                identity: identity.clone(),
                payment_id: event.payment_id.clone(),
                credits: plan.credits,
            });
        }

        Ok(PaymentConfirmation {
            payment_id: event.payment_id.clone(),
            identity,
            plan_id: plan.id,
            credits: plan.credits,
            transaction_id: receipt.transaction_id.to_string(),
            balance: receipt.balance,
            applied: receipt.applied,
            valid_until: subscription.map(|s| s.valid_until),
        })
    }

    async fn hold(&self, event: &PaymentEvent, plan: &Plan) -> CoreResult<()> {
        let inserted = self
            .call(
                "record_payment",
                self.store.record_payment(&PaymentRecord {
                    payment_id: event.payment_id.clone(),
                    claimed_identity: event.identity.clone(),
                    identity: None,
                    plan_id: plan.id.clone(),
                    amount: event.amount,
                    currency: event.currency.clone().unwrap_or_else(|| plan.currency.clone()),
                    delivered_at: event.delivered_at,
                    status: PaymentStatus::GuestHeld,
                    transaction_id: None,
                    note: None,
                    recorded_at: Utc::now(),
                }),
            )
            .await?;
        if inserted {
            tracing::warn!(
                payment_id = %event.payment_id,
                claimed_identity = event.identity.as_deref().unwrap_or(""),
                plan = %plan.id,
                "Payment matched no account, held in guest bucket"
            );
            self.notifier.notify(CoreEvent::PaymentHeld {
                payment_id: event.payment_id.clone(),
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        payment_id: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        identity: &IdentityId,
        plan: &Plan,
        receipt: &LedgerReceipt,
        note: Option<&str>,
    ) -> CoreResult<Option<Subscription>> {
        let settled = self
            .call(
                "settle_payment",
                self.store.settle_payment(Settlement {
                    payment_id: payment_id.to_string(),
                    from,
                    to,
                    identity: identity.clone(),
                    transaction_id: receipt.transaction_id.clone(),
                    plan_id: plan.id.clone(),
                    duration_months: plan.duration_months,
                    note: note.map(str::to_string),
                    now: Utc::now(),
                }),
            )
            .await?;
        match settled {
            Some(subscription) => Ok(Some(subscription)),
            // A concurrent delivery settled it first.
            None => self.call("subscription", self.store.subscription(identity)).await,
        }
    }

    /// Confirmation for a payment that was already settled, built from what
    /// was recorded rather than from the redelivered event.
    async fn replayed(&self, record: &PaymentRecord) -> CoreResult<PaymentConfirmation> {
        let identity = record.identity.clone().ok_or_else(|| {
            CoreError::Storage(StoreError::Corrupt(format!(
                "settled payment {} has no identity",
                record.payment_id
            )))
        })?;
        let granted = match &record.transaction_id {
            Some(id) => self.ledger.transaction(id).await?,
            None => None,
        };
        let credits = granted
            .map(|tx| tx.amount.unsigned_abs())
            .or_else(|| self.catalog.find(&record.plan_id).map(|plan| plan.credits))
            .unwrap_or(0);
        let balance = self.ledger.get_balance(&identity).await?;
        let subscription = self
            .call("subscription", self.store.subscription(&identity))
            .await?;
        tracing::debug!(payment_id = %record.payment_id, "Payment redelivered, already applied");
        Ok(PaymentConfirmation {
            payment_id: record.payment_id.clone(),
            identity,
            plan_id: record.plan_id.clone(),
            credits,
            transaction_id: record
                .transaction_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            balance,
            applied: Applied::AlreadyProcessed,
            valid_until: subscription.map(|s| s.valid_until),
        })
    }

    /// Payments waiting in the guest bucket.
    pub async fn guest_payments(&self) -> CoreResult<Vec<PaymentRecord>> {
        self.call(
            "payments_with_status",
            self.store.payments_with_status(PaymentStatus::GuestHeld),
        )
        .await
    }

    /// Audited migration of a guest-bucket payment onto `identity`.
    pub async fn claim_guest_payment(
        &self,
        payment_id: &str,
        identity: &IdentityId,
        note: &str,
    ) -> CoreResult<PaymentConfirmation> {
        let note = note.trim();
        if note.is_empty() {
            return Err(CoreError::InvalidRequest(
                "guest payment migration requires a note".into(),
            ));
        }
        if identity.as_str().trim().is_empty() || identity.as_str() == GUEST_IDENTITY {
            return Err(CoreError::InvalidRequest(
                "guest payments must move to a real account".into(),
            ));
        }
        let record = self
            .call("payment", self.store.payment(payment_id))
            .await?
            .ok_or_else(|| CoreError::not_found("payment", payment_id))?;
        match record.status {
            PaymentStatus::GuestHeld => {}
            PaymentStatus::Migrated if record.identity.as_ref() == Some(identity) => {
                return self.replayed(&record).await;
            }
            other => {
                return Err(CoreError::InvalidRequest(format!(
                    "payment {payment_id} is {other}, not held in the guest bucket"
                )));
            }
        }
        let plan = self
            .catalog
            .find(&record.plan_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownPlan(record.plan_id.clone()))?;

        let receipt = self
            .ledger
            .grant(
                identity,
                plan.credits,
                &format!("{} plan purchase ({payment_id}) migrated from guest bucket: {note}", plan.name),
                payment_id,
            )
            .await?;
        let subscription = self
            .settle(
                payment_id,
                PaymentStatus::GuestHeld,
                PaymentStatus::Migrated,
                identity,
                &plan,
                &receipt,
                Some(note),
            )
            .await?;

        tracing::info!(
            payment_id,
            identity = %identity,
            plan = %plan.id,
            credits = plan.credits,
            note,
            "Guest payment migrated"
        );
        if receipt.is_new() {
            self.notifier.notify(CoreEvent::PaymentApplied {
                identity: identity.clone(),
                payment_id: payment_id.to_string(),
                credits: plan.credits,
            });
        }

        Ok(PaymentConfirmation {
            payment_id: payment_id.to_string(),
            identity: identity.clone(),
            plan_id: plan.id,
            credits: plan.credits,
            transaction_id: receipt.transaction_id.to_string(),
            balance: receipt.balance,
            applied: receipt.applied,
            valid_until: subscription.map(|s| s.valid_until),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LedgerConfig, StoreConfig};
    use crate::store::{Identity, SqliteStore};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: Arc<dyn CreditStore>,
        ledger: Arc<CreditLedger>,
        reconciler: PaymentReconciler,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn CreditStore> = Arc::new(
            SqliteStore::open(&tmp.path().join("credits.db"), Duration::from_secs(5)).unwrap(),
        );
        let notifier = Notifier::new();
        let ledger = Arc::new(CreditLedger::new(
            Arc::clone(&store),
            notifier.clone(),
            &StoreConfig::default(),
            &LedgerConfig {
                welcome_grant: 0,
                max_conflict_retries: 5,
            },
        ));
        let catalog = Arc::new(PlanCatalog::from_config(&Config::default().plans).unwrap());
        let reconciler = PaymentReconciler::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            catalog,
            notifier,
            Duration::from_secs(5),
        );
        Fixture {
            _tmp: tmp,
            store,
            ledger,
            reconciler,
        }
    }

    async fn known(f: &Fixture, id: &str) -> IdentityId {
        let identity = Identity {
            id: IdentityId::from(id),
            email: Some(format!("{id}@example.com")),
        };
        f.store.upsert_identity(&identity).await.unwrap();
        identity.id
    }

    fn event(payment_id: &str, identity: Option<&str>, plan_id: &str, amount: u64) -> PaymentEvent {
        PaymentEvent {
            payment_id: payment_id.into(),
            identity: identity.map(str::to_string),
            plan_id: plan_id.into(),
            amount,
            currency: Some("VND".into()),
            delivered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn redelivered_payment_grants_once() {
        let f = fixture();
        let alice = known(&f, "alice").await;
        let p1 = event("P1", Some("alice"), "plan_pro", 599_000);

        let first = f.reconciler.apply(&p1).await.unwrap();
        assert_eq!(first.applied, Applied::New);
        assert_eq!(first.balance, 7_000);
        assert!(first.valid_until.is_some());

        let second = f.reconciler.apply(&p1).await.unwrap();
        assert_eq!(second.applied, Applied::AlreadyProcessed);
        assert_eq!(second.transaction_id, first.transaction_id);
        assert_eq!(second.valid_until, first.valid_until);
        assert_eq!(f.ledger.get_balance(&alice).await.unwrap(), 7_000);
        assert!(second.message().contains("already applied"));
    }

    #[tokio::test]
    async fn redelivery_is_answered_from_the_stored_payment() {
        let f = fixture();
        let alice = known(&f, "alice").await;
        let first = f
            .reconciler
            .apply(&event("P6", Some("alice"), "plan_pro", 599_000))
            .await
            .unwrap();

        // The resend names a plan that is not (or no longer) in the catalog.
        let replay = f
            .reconciler
            .apply(&event("P6", Some("alice"), "plan_retired", 599_000))
            .await
            .unwrap();
        assert_eq!(replay.applied, Applied::AlreadyProcessed);
        assert_eq!(replay.plan_id, "plan_pro");
        assert_eq!(replay.credits, 7_000);
        assert_eq!(replay.transaction_id, first.transaction_id);

        let other_plan = f
            .reconciler
            .apply(&event("P6", Some("alice"), "plan_starter", 299_000))
            .await
            .unwrap();
        assert_eq!(other_plan.plan_id, "plan_pro");
        assert_eq!(f.ledger.get_balance(&alice).await.unwrap(), 7_000);
    }

    #[tokio::test]
    async fn payment_id_owned_by_another_account_is_not_applied() {
        let f = fixture();
        let alice = known(&f, "alice").await;
        let bob = known(&f, "bob").await;
        f.ledger.grant(&alice, 10, "gift", "P7").await.unwrap();

        let err = f
            .reconciler
            .apply(&event("P7", Some("bob"), "plan_starter", 299_000))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::KeyOwnedByOtherAccount { .. }));
        assert_eq!(f.ledger.get_balance(&bob).await.unwrap(), 0);
        let stored = f.store.payment("P7").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Received);
    }

    #[tokio::test]
    async fn interrupted_delivery_is_finished_by_the_retry() {
        let f = fixture();
        let alice = known(&f, "alice").await;
        // Grant landed but the payment row was never settled.
        f.store
            .record_payment(&PaymentRecord {
                payment_id: "P2".into(),
                claimed_identity: Some("alice".into()),
                identity: None,
                plan_id: "plan_starter".into(),
                amount: 299_000,
                currency: "VND".into(),
                delivered_at: Utc::now(),
                status: PaymentStatus::Received,
                transaction_id: None,
                note: None,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();
        f.ledger.grant(&alice, 3_000, "Starter", "P2").await.unwrap();

        let confirmation = f
            .reconciler
            .apply(&event("P2", Some("alice"), "plan_starter", 299_000))
            .await
            .unwrap();
        assert_eq!(confirmation.applied, Applied::AlreadyProcessed);
        assert!(confirmation.valid_until.is_some());
        assert_eq!(f.ledger.get_balance(&alice).await.unwrap(), 3_000);
        let stored = f.store.payment("P2").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Applied);
    }

    #[tokio::test]
    async fn unknown_plan_is_rejected_without_side_effects() {
        let f = fixture();
        known(&f, "alice").await;
        let err = f
            .reconciler
            .apply(&event("P3", Some("alice"), "plan_mega", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownPlan(_)));
        assert!(f.store.payment("P3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn plan_is_matched_by_price_when_id_is_missing() {
        let f = fixture();
        known(&f, "alice").await;
        let confirmation = f
            .reconciler
            .apply(&event("P4", Some("alice"), "", 1_999_000))
            .await
            .unwrap();
        assert_eq!(confirmation.plan_id, "plan_ultra");
        assert_eq!(confirmation.credits, 25_000);
    }

    #[tokio::test]
    async fn guest_payment_is_held_not_credited() {
        let f = fixture();
        let err = f
            .reconciler
            .apply(&event("G1", Some("guest"), "plan_pro", 599_000))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownIdentity { .. }));

        let held = f.reconciler.guest_payments().await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].payment_id, "G1");

        // Redelivery stays in the bucket.
        let again = f
            .reconciler
            .apply(&event("G1", Some("guest"), "plan_pro", 599_000))
            .await
            .unwrap_err();
        assert!(matches!(again, CoreError::UnknownIdentity { .. }));
        assert_eq!(f.reconciler.guest_payments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unseen_identity_goes_to_guest_bucket() {
        let f = fixture();
        let err = f
            .reconciler
            .apply(&event("G2", Some("stranger"), "plan_starter", 299_000))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownIdentity { .. }));
        assert!(f
            .store
            .account(&IdentityId::from("stranger"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn guest_claim_is_explicit_and_single() {
        let f = fixture();
        let bob = known(&f, "bob").await;
        let _ = f
            .reconciler
            .apply(&event("G3", None, "plan_starter", 299_000))
            .await;

        let missing_note = f.reconciler.claim_guest_payment("G3", &bob, "  ").await;
        assert!(matches!(missing_note, Err(CoreError::InvalidRequest(_))));

        let claimed = f
            .reconciler
            .claim_guest_payment("G3", &bob, "ticket #12, transfer memo matched")
            .await
            .unwrap();
        assert_eq!(claimed.applied, Applied::New);
        assert_eq!(claimed.balance, 3_000);

        let replay = f
            .reconciler
            .claim_guest_payment("G3", &bob, "ticket #12, transfer memo matched")
            .await
            .unwrap();
        assert_eq!(replay.applied, Applied::AlreadyProcessed);
        assert_eq!(f.ledger.get_balance(&bob).await.unwrap(), 3_000);

        let stored = f.store.payment("G3").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Migrated);
        assert_eq!(stored.note.as_deref(), Some("ticket #12, transfer memo matched"));
        assert!(f.reconciler.guest_payments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn applied_payments_cannot_be_claimed() {
        let f = fixture();
        let alice = known(&f, "alice").await;
        f.reconciler
            .apply(&event("P5", Some("alice"), "plan_pro", 599_000))
            .await
            .unwrap();
        let err = f
            .reconciler
            .claim_guest_payment("P5", &alice, "mistake")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }

    #[test]
    fn event_json_defaults() {
        let event: PaymentEvent =
            serde_json::from_str(r#"{"payment_id":"P9","amount":599000}"#).unwrap();
        assert_eq!(event.identity, None);
        assert_eq!(event.plan_id, "");
    }
}
