//! Credit Ledger: authoritative balances and the append-only transaction log.
//!
//! Every mutation is a single conditional append against the account version
//! ([`CreditStore::append`]). A lost race re-reads the account and retries, up
//! to `max_conflict_retries` times, so two clients can never both spend the
//! same credits. Correlation keys make retries idempotent: a repeated key
//! resolves to the original transaction with [`Applied::AlreadyProcessed`],
//! as long as it is repeated by the account that first used it.

use crate::config::{LedgerConfig, StoreConfig};
use crate::error::{CoreError, CoreResult, StoreError};
use crate::events::{CoreEvent, Notifier};
use crate::store::{
    bounded, Account, AppendOutcome, CreditStore, IdentityId, NewTransaction, ReadRetry,
    Transaction, TransactionId,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Whether a receipt describes a fresh write or a replay of an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Applied {
    New,
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerReceipt {
    pub transaction_id: TransactionId,
    /// Balance of the account after the operation (or now, for replays).
    pub balance: i64,
    pub applied: Applied,
}

impl LedgerReceipt {
    pub fn is_new(&self) -> bool {
        self.applied == Applied::New
    }
}

/// Result of comparing the stored balance with the transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub identity: IdentityId,
    pub balance: i64,
    pub transaction_sum: i64,
    pub consistent: bool,
}

/// Correlation key of the one-time welcome grant.
pub fn welcome_key(identity: &IdentityId) -> String {
    format!("welcome:{identity}")
}

struct Entry {
    amount: i64,
    reason: String,
    correlation_key: Option<String>,
    reverses: Option<TransactionId>,
}

pub struct CreditLedger {
    store: Arc<dyn CreditStore>,
    notifier: Notifier,
    timeout: Duration,
    read_retry: ReadRetry,
    welcome_grant: u64,
    max_conflict_retries: u32,
}

impl CreditLedger {
    pub fn new(
        store: Arc<dyn CreditStore>,
        notifier: Notifier,
        store_config: &StoreConfig,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            timeout: store_config.remote_timeout(),
            read_retry: ReadRetry::new(store_config.read_retries, store_config.read_backoff()),
            welcome_grant: config.welcome_grant,
            max_conflict_retries: config.max_conflict_retries.max(1),
        }
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> CoreResult<T>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        bounded(self.timeout, op, fut).await
    }

    /// Current balance, opening the account (and granting the welcome
    /// credits) on first access.
    pub async fn get_balance(&self, identity: &IdentityId) -> CoreResult<i64> {
        self.read_retry
            .run("get_balance", || async {
                self.open_account(identity).await.map(|account| account.balance)
            })
            .await
    }

    /// Return the account, creating it with the welcome grant if needed.
    ///
    /// Concurrent first access from several clients is safe: the welcome
    /// grant is keyed by [`welcome_key`], so duplicates collapse to one entry.
    pub async fn open_account(&self, identity: &IdentityId) -> CoreResult<Account> {
        if let Some(account) = self.call("account", self.store.account(identity)).await? {
            // Every mutation goes through here first, so a non-zero version
            // means the welcome grant was already attempted.
            if account.version > 0 || self.welcome_grant == 0 {
                return Ok(account);
            }
        }
        let account = self
            .call("ensure_account", self.store.ensure_account(identity))
            .await?;
        if self.welcome_grant == 0 {
            return Ok(account);
        }

        let amount = positive(self.welcome_grant)?;
        let receipt = self
            .apply(
                identity,
                Entry {
                    amount,
                    reason: "Welcome credits".into(),
                    correlation_key: Some(welcome_key(identity)),
                    reverses: None,
                },
            )
            .await?;
        if receipt.is_new() {
            tracing::info!(identity = %identity, credits = amount, "Opened ledger account");
        }
        self.call("account", self.store.account(identity))
            .await?
            .ok_or_else(|| CoreError::not_found("account", identity.as_str()))
    }

    /// Spend `amount` credits. Fails with `InsufficientCredits` without
    /// touching the balance when the account cannot cover it.
    pub async fn debit(
        &self,
        identity: &IdentityId,
        amount: u64,
        reason: &str,
        correlation_key: Option<&str>,
    ) -> CoreResult<LedgerReceipt> {
        let amount = positive(amount)?;
        self.open_account(identity).await?;
        self.apply(
            identity,
            Entry {
                amount: -amount,
                reason: reason.to_string(),
                correlation_key: correlation_key.map(str::to_string),
                reverses: None,
            },
        )
        .await
    }

    /// Add `amount` credits, at most once per correlation key.
    pub async fn grant(
        &self,
        identity: &IdentityId,
        amount: u64,
        reason: &str,
        correlation_key: &str,
    ) -> CoreResult<LedgerReceipt> {
        let amount = positive(amount)?;
        self.open_account(identity).await?;
        self.apply(
            identity,
            Entry {
                amount,
                reason: reason.to_string(),
                correlation_key: Some(correlation_key.to_string()),
                reverses: None,
            },
        )
        .await
    }

    /// Append the equal and opposite entry for `transaction_id`. A transaction
    /// can be reversed once; compensating entries cannot be reversed at all.
    pub async fn reverse(&self, transaction_id: &TransactionId) -> CoreResult<LedgerReceipt> {
        let original = self
            .call("transaction", self.store.transaction(transaction_id))
            .await?
            .ok_or_else(|| CoreError::not_found("transaction", transaction_id.as_str()))?;
        if original.reverses.is_some() {
            return Err(CoreError::NotReversible {
                transaction_id: transaction_id.to_string(),
            });
        }
        if self
            .call("reversal_of", self.store.reversal_of(transaction_id))
            .await?
            .is_some()
        {
            return Err(CoreError::AlreadyReversed {
                transaction_id: transaction_id.to_string(),
            });
        }

        let receipt = self
            .apply(
                &original.account,
                Entry {
                    amount: -original.amount,
                    reason: format!("Reversal: {}", original.reason),
                    correlation_key: None,
                    reverses: Some(original.id.clone()),
                },
            )
            .await?;
        tracing::info!(
            identity = %original.account,
            transaction_id = %original.id,
            amount = -original.amount,
            "Reversed ledger transaction"
        );
        Ok(receipt)
    }

    /// Newest-first transactions of `identity`.
    pub async fn history(
        &self,
        identity: &IdentityId,
        limit: usize,
    ) -> CoreResult<Vec<Transaction>> {
        self.read_retry
            .run("history", || {
                self.call("transactions", self.store.transactions(identity, limit))
            })
            .await
    }

    pub async fn transaction(&self, id: &TransactionId) -> CoreResult<Option<Transaction>> {
        self.call("transaction", self.store.transaction(id)).await
    }

    pub async fn transaction_by_key(&self, key: &str) -> CoreResult<Option<Transaction>> {
        self.call("transaction_by_key", self.store.transaction_by_key(key))
            .await
    }

    /// Check that the stored balance equals the sum of the log.
    pub async fn reconcile(&self, identity: &IdentityId) -> CoreResult<Reconciliation> {
        let balance = self
            .call("account", self.store.account(identity))
            .await?
            .map_or(0, |account| account.balance);
        let transaction_sum = self
            .call("transaction_sum", self.store.transaction_sum(identity))
            .await?;
        let consistent = balance == transaction_sum;
        if !consistent {
            tracing::error!(
                identity = %identity,
                balance,
                transaction_sum,
                "Ledger balance does not match transaction log"
            );
        }
        Ok(Reconciliation {
            identity: identity.clone(),
            balance,
            transaction_sum,
            consistent,
        })
    }

    async fn apply(&self, identity: &IdentityId, entry: Entry) -> CoreResult<LedgerReceipt> {
        if let Some(key) = entry.correlation_key.as_deref() {
            if let Some(existing) = self
                .call("transaction_by_key", self.store.transaction_by_key(key))
                .await?
            {
                return self.replayed(identity, existing).await;
            }
        }

        let mut account = self
            .call("ensure_account", self.store.ensure_account(identity))
            .await?;
        let transaction_id = TransactionId::generate();

        for attempt in 1..=self.max_conflict_retries {
            if entry.amount < 0 && account.balance + entry.amount < 0 {
                return Err(insufficient(entry.amount.unsigned_abs(), account.balance));
            }

            let new = NewTransaction {
                id: transaction_id.clone(),
                amount: entry.amount,
                reason: entry.reason.clone(),
                correlation_key: entry.correlation_key.clone(),
                reverses: entry.reverses.clone(),
            };
            match self
                .call("append", self.store.append(identity, account.version, new))
                .await?
            {
                AppendOutcome::Appended {
                    transaction,
                    account: after,
                } => {
                    tracing::debug!(
                        identity = %identity,
                        transaction_id = %transaction.id,
                        amount = transaction.amount,
                        balance = after.balance,
                        "Ledger transaction appended"
                    );
                    self.notifier.notify(CoreEvent::BalanceChanged {
                        identity: identity.clone(),
                        balance: after.balance,
                        transaction_id: transaction.id.clone(),
                    });
                    return Ok(LedgerReceipt {
                        transaction_id: transaction.id,
                        balance: after.balance,
                        applied: Applied::New,
                    });
                }
                AppendOutcome::DuplicateCorrelation(existing) => {
                    return self.replayed(identity, existing).await;
                }
                AppendOutcome::AlreadyReversed(existing) => {
                    return Err(CoreError::AlreadyReversed {
                        transaction_id: existing
                            .reverses
                            .map(|id| id.to_string())
                            .unwrap_or_default(),
                    });
                }
                AppendOutcome::VersionConflict { current } => {
                    tracing::debug!(identity = %identity, attempt, "Ledger version conflict, retrying");
                    account = match current {
                        Some(current) => current,
                        None => {
                            self.call("ensure_account", self.store.ensure_account(identity))
                                .await?
                        }
                    };
                }
            }
        }

        tracing::warn!(
            identity = %identity,
            attempts = self.max_conflict_retries,
            "Ledger write gave up after repeated conflicts"
        );
        Err(CoreError::Conflict {
            attempts: self.max_conflict_retries,
        })
    }

    async fn replayed(
        &self,
        identity: &IdentityId,
        existing: Transaction,
    ) -> CoreResult<LedgerReceipt> {
        if &existing.account != identity {
            tracing::warn!(
                identity = %identity,
                owner = %existing.account,
                transaction_id = %existing.id,
                "Correlation key already used by another account"
            );
            return Err(CoreError::KeyOwnedByOtherAccount {
                key: existing.correlation_key.unwrap_or_default(),
                owner: existing.account.to_string(),
            });
        }
        let balance = self
            .call("account", self.store.account(identity))
            .await?
            .map_or(0, |account| account.balance);
        Ok(LedgerReceipt {
            transaction_id: existing.id,
            balance,
            applied: Applied::AlreadyProcessed,
        })
    }
}

fn positive(amount: u64) -> CoreResult<i64> {
    if amount == 0 {
        return Err(CoreError::InvalidAmount("amount must be positive".into()));
    }
    i64::try_from(amount).map_err(|_| CoreError::InvalidAmount(format!("{amount} is too large")))
}

fn insufficient(required: u64, available: i64) -> CoreError {
    let covered = u64::try_from(available.max(0)).unwrap_or(0);
    CoreError::InsufficientCredits {
        required,
        available,
        shortfall: required.saturating_sub(covered),
    }
}
