//! Background scheduler task.
//!
//! This task periodically runs the due scan and hands every newly locked
//! execution to the external execution engine over a channel.

use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use super::scan::{SchedulerConfig, WorkflowScheduler};
use crate::backends::{DispatchedExecution, ExecutionLedger};

/// Background task driving [`WorkflowScheduler::tick`] on a timer.
pub struct SchedulerTask<L> {
    scheduler: WorkflowScheduler<L>,
    dispatch_tx: mpsc::Sender<DispatchedExecution>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<L> SchedulerTask<L>
where
    L: ExecutionLedger + 'static,
{
    pub fn new(
        ledger: L,
        config: SchedulerConfig,
        dispatch_tx: mpsc::Sender<DispatchedExecution>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            scheduler: WorkflowScheduler::new(ledger, config),
            dispatch_tx,
            shutdown_rx,
        }
    }

    /// Run the scheduler loop until shutdown is signalled.
    pub async fn run(mut self) {
        info!(
            poll_interval_ms = self.scheduler.config().poll_interval.as_millis(),
            stale_after_secs = self.scheduler.config().stale_after.num_seconds(),
            "scheduler task started"
        );

        let mut ticker = interval(self.scheduler.config().poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!("scheduler task shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    async fn poll_once(&self) {
        let dispatched = match self.scheduler.tick(chrono::Utc::now()).await {
            Ok(dispatched) => dispatched,
            Err(err) => {
                // The store is unreachable or broken; nothing partial was
                // committed, so the next tick simply retries.
                metrics::counter!("ratchet_tick_errors_total").increment(1);
                error!(?err, "scheduler tick failed");
                return;
            }
        };

        if dispatched.is_empty() {
            return;
        }
        debug!(count = dispatched.len(), "dispatching locked executions");

        for execution in dispatched {
            metrics::counter!("ratchet_dispatched_executions_total").increment(1);
            if self.dispatch_tx.send(execution).await.is_err() {
                // The engine side is gone; the locked runs will surface
                // as stale and be reclaimed by a later tick.
                warn!("dispatch channel closed, dropping execution handoff");
                break;
            }
        }
    }
}

/// Convenience function to spawn a scheduler task.
///
/// Returns the task handle and the shutdown trigger; send `true` to stop
/// the loop after the in-flight tick.
pub fn spawn_scheduler<L>(
    ledger: L,
    config: SchedulerConfig,
    dispatch_tx: mpsc::Sender<DispatchedExecution>,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>)
where
    L: ExecutionLedger + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = SchedulerTask::new(ledger, config, dispatch_tx, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}
