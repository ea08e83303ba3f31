//! In-process notifications for UI surfaces.
//!
//! Components publish on a shared broadcast channel; subscribers that lag
//! simply miss events and re-read state, so sends never block.

use crate::store::{IdentityId, JobId, TransactionId};
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    BalanceChanged {
        identity: IdentityId,
        balance: i64,
        transaction_id: TransactionId,
    },
    JobRejected {
        identity: IdentityId,
        job_id: JobId,
        tool_id: String,
        shortfall: u64,
    },
    JobReaped {
        identity: IdentityId,
        job_id: JobId,
    },
    PaymentApplied {
        identity: IdentityId,
        payment_id: String,
        credits: u64,
    },
    PaymentHeld {
        payment_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn notify(&self, event: CoreEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}
