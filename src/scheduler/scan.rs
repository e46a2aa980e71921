//! Due-workflow scan: one `tick` across all scheduled workflows.
//!
//! A tick walks every active workflow, decides whether its interval has
//! elapsed since the last completed run, and tries to acquire the next
//! sequence-number slot in the ledger. Multiple scheduler instances run
//! ticks on independent timers with no shared memory; the ledger's
//! uniqueness constraint arbitrates every race.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use crate::backends::{
    AcquireOutcome, AcquireRequest, DispatchedExecution, ExecutionId, ExecutionLedger,
    LedgerError, LedgerResult, WorkflowExecution, WorkflowRef,
};

/// Policy knobs for the due scan and its driving task.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the background task runs a tick.
    pub poll_interval: std::time::Duration,
    /// An `in_progress` execution older than this is presumed abandoned
    /// and may be reclaimed. Fixed policy, not derived from workflow
    /// intervals.
    pub stale_after: Duration,
    /// Completed executions older than this window are ignored when
    /// computing due-ness; a workflow idle longer is treated as
    /// never-run.
    pub lookback: Duration,
    /// Restrict the scan to one tenant. `None` scans every tenant.
    pub tenant_scope: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(10),
            stale_after: Duration::seconds(3600),
            lookback: Duration::days(7),
            tenant_scope: None,
        }
    }
}

/// Scans workflows and acquires execution slots.
///
/// The ledger handle is the only state; nothing about lock ownership is
/// cached between calls because any cached view can be stale the moment
/// another instance acts.
pub struct WorkflowScheduler<L> {
    ledger: L,
    config: SchedulerConfig,
}

impl<L: ExecutionLedger> WorkflowScheduler<L> {
    pub fn new(ledger: L, config: SchedulerConfig) -> Self {
        Self { ledger, config }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one scan at the given instant and return the executions this
    /// instance locked. An unreachable store aborts the tick (nothing
    /// partial is committed, the next tick starts from a clean read);
    /// any other per-workflow failure only skips that workflow.
    pub async fn tick(&self, now: DateTime<Utc>) -> LedgerResult<Vec<DispatchedExecution>> {
        let workflows = self
            .ledger
            .list_active_workflows(self.config.tenant_scope.as_deref())
            .await?;
        debug!(count = workflows.len(), "scanning workflows with an interval");

        let mut dispatched = Vec::new();
        for workflow in &workflows {
            match self.check_workflow(workflow, now).await {
                Ok(Some(execution)) => dispatched.push(execution),
                Ok(None) => {}
                Err(err @ (LedgerError::Sqlx(_) | LedgerError::Migration(_))) => {
                    return Err(err);
                }
                Err(err) => {
                    error!(
                        workflow_id = %workflow.id,
                        ?err,
                        "failed to evaluate workflow, skipping"
                    );
                }
            }
        }
        Ok(dispatched)
    }

    /// Decide whether one workflow is due and try to lock its next run.
    async fn check_workflow(
        &self,
        workflow: &WorkflowRef,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<DispatchedExecution>> {
        let since = now - self.config.lookback;
        let last = self.ledger.last_completed(&workflow.id, since).await?;

        let Some(last) = last else {
            // Never run (or idle past the lookback window): the first
            // sequence number is up for grabs.
            return self.acquire(workflow, 1, now).await;
        };

        let due_at = last.started + Duration::seconds(workflow.interval);
        if now < due_at {
            return Ok(None);
        }

        let execution_number = last.execution_number + 1;
        match self
            .ledger
            .try_acquire(&AcquireRequest::scheduled(workflow, execution_number), now)
            .await?
        {
            AcquireOutcome::Acquired(execution_id) => {
                debug!(
                    workflow_id = %workflow.id,
                    execution_number,
                    "acquired execution slot"
                );
                Ok(Some(dispatch(workflow, execution_id)))
            }
            AcquireOutcome::Conflict => self.arbitrate_conflict(workflow, execution_number, now).await,
        }
    }

    /// First-run acquisition: on conflict another instance got there
    /// first, and with no completed execution to anchor a staleness
    /// check the workflow is simply skipped this tick.
    async fn acquire(
        &self,
        workflow: &WorkflowRef,
        execution_number: i32,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<DispatchedExecution>> {
        match self
            .ledger
            .try_acquire(&AcquireRequest::scheduled(workflow, execution_number), now)
            .await?
        {
            AcquireOutcome::Acquired(execution_id) => {
                debug!(
                    workflow_id = %workflow.id,
                    execution_number,
                    "acquired execution slot"
                );
                Ok(Some(dispatch(workflow, execution_id)))
            }
            AcquireOutcome::Conflict => {
                metrics::counter!("ratchet_lock_conflicts_total").increment(1);
                debug!(
                    workflow_id = %workflow.id,
                    execution_number,
                    "execution slot already taken"
                );
                Ok(None)
            }
        }
    }

    /// A conflict on an incremented sequence number means some instance
    /// holds (or held) that slot. Re-read the ledger to tell a healthy
    /// owner from an abandoned one.
    async fn arbitrate_conflict(
        &self,
        workflow: &WorkflowRef,
        execution_number: i32,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<DispatchedExecution>> {
        metrics::counter!("ratchet_lock_conflicts_total").increment(1);

        let ongoing = self
            .ledger
            .execution_by_number(&workflow.id, execution_number)
            .await?;
        let Some(ongoing) = ongoing else {
            // The constraint rejected our insert, yet no row is visible.
            // No repair is attempted; the workflow sits out this tick.
            metrics::counter!("ratchet_ledger_inconsistencies_total").increment(1);
            error!(
                workflow_id = %workflow.id,
                execution_number,
                "lock conflict but no execution row is visible"
            );
            return Ok(None);
        };

        if ongoing.status.is_terminal() {
            // Another instance already finished this slot; the next tick
            // will compute due-ness from it.
            return Ok(None);
        }

        if now < ongoing.started + self.config.stale_after {
            debug!(
                workflow_id = %workflow.id,
                execution_number,
                "workflow is already running on another instance"
            );
            return Ok(None);
        }

        self.reclaim(workflow, &ongoing, now).await
    }

    /// Mark an abandoned run as timed out, then immediately contend for
    /// the next sequence number. The retry does not wait out the
    /// workflow's interval; a reclaimed slot is rescheduled at once.
    async fn reclaim(
        &self,
        workflow: &WorkflowRef,
        stale: &WorkflowExecution,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<DispatchedExecution>> {
        if self.ledger.mark_timed_out(stale.id).await? {
            metrics::counter!("ratchet_reclaimed_executions_total").increment(1);
            info!(
                workflow_id = %workflow.id,
                execution_id = %stale.id,
                execution_number = stale.execution_number,
                "marked stale execution as timed out"
            );
        }

        let execution_number = stale.execution_number + 1;
        match self
            .ledger
            .try_acquire(&AcquireRequest::scheduled(workflow, execution_number), now)
            .await?
        {
            AcquireOutcome::Acquired(execution_id) => {
                info!(
                    workflow_id = %workflow.id,
                    execution_number,
                    "reacquired workflow after timeout"
                );
                Ok(Some(dispatch(workflow, execution_id)))
            }
            AcquireOutcome::Conflict => {
                // Another instance won the reclaim race; expected.
                metrics::counter!("ratchet_lock_conflicts_total").increment(1);
                debug!(
                    workflow_id = %workflow.id,
                    execution_number,
                    "another instance reclaimed the workflow first"
                );
                Ok(None)
            }
        }
    }
}

fn dispatch(workflow: &WorkflowRef, execution_id: ExecutionId) -> DispatchedExecution {
    DispatchedExecution {
        tenant_id: workflow.tenant_id.clone(),
        workflow_id: workflow.id.clone(),
        execution_id,
    }
}
