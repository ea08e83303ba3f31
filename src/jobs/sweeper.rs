//! Background sweeps. Failures are logged and retried on the next tick; they
//! never reach the caller that started the task.

use super::JobTracker;
use crate::store::IdentityId;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Run the global stale-job sweep (and retention purge) every `interval`
/// until `cancel` fires.
pub fn spawn_sweeper(
    tracker: Arc<JobTracker>,
    interval: Duration,
    stale_after: Duration,
    retention: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = interval.as_secs(),
            stale_after_secs = stale_after.as_secs(),
            "Stale job sweeper started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = tracker.sweep_stale(stale_after, None).await {
                tracing::warn!(error = %e, "Stale job sweep failed");
            }
            if let Err(e) = tracker.purge(retention).await {
                tracing::warn!(error = %e, "Job purge failed");
            }
        }
        tracing::info!("Stale job sweeper stopped");
    })
}

/// One fire-and-forget sweep limited to `identity`, started when a session
/// becomes authenticated.
pub fn spawn_session_sweep(
    tracker: Arc<JobTracker>,
    identity: IdentityId,
    stale_after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tracker.sweep_stale(stale_after, Some(&identity)).await {
            Ok(report) if report.reaped > 0 || report.reversed > 0 => {
                tracing::info!(
                    identity = %identity,
                    reaped = report.reaped,
                    credits = report.credits_restored,
                    "Session start sweep reclaimed credits"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "Session start sweep failed");
            }
        }
    })
}
