//! Scheduling-protocol tests against the in-memory ledger.
//!
//! Every test drives `tick` with explicit instants, so time-dependent
//! behavior (due boundaries, staleness) is exercised without sleeping.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use ratchet::{
    AcquireOutcome, AcquireRequest, CompleteError, DispatchedExecution, ExecutionId,
    ExecutionLedger, ExecutionStatus, LedgerResult, MemoryLedger, SchedulerConfig,
    WorkflowExecution, WorkflowRef, WorkflowScheduler, spawn_scheduler,
};

const TENANT: &str = "tenant-1";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        stale_after: Duration::minutes(60),
        lookback: Duration::days(7),
        ..SchedulerConfig::default()
    }
}

fn scheduler(ledger: &MemoryLedger) -> WorkflowScheduler<MemoryLedger> {
    WorkflowScheduler::new(ledger.clone(), test_config())
}

fn scheduled_request(workflow_id: &str, execution_number: i32) -> AcquireRequest {
    AcquireRequest {
        workflow_id: workflow_id.to_string(),
        tenant_id: TENANT.to_string(),
        triggered_by: "scheduler".to_string(),
        execution_number,
        origin: None,
    }
}

/// Acquire a slot directly on the ledger, panicking on contention.
async fn acquire(ledger: &MemoryLedger, workflow_id: &str, number: i32, now: DateTime<Utc>) -> ExecutionId {
    match ledger
        .try_acquire(&scheduled_request(workflow_id, number), now)
        .await
        .expect("acquire")
    {
        AcquireOutcome::Acquired(id) => id,
        AcquireOutcome::Conflict => panic!("unexpected conflict for {workflow_id}#{number}"),
    }
}

async fn complete_success(
    ledger: &MemoryLedger,
    workflow_id: &str,
    execution_id: ExecutionId,
    now: DateTime<Utc>,
) {
    ledger
        .complete(
            TENANT,
            workflow_id,
            execution_id,
            ExecutionStatus::Success,
            None,
            now,
        )
        .await
        .expect("complete");
}

#[tokio::test]
async fn concurrent_acquires_elect_exactly_one_winner() {
    let ledger = MemoryLedger::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .try_acquire(&scheduled_request("wf-race", 1), t0())
                .await
                .expect("acquire")
        }));
    }

    let mut acquired = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("join") {
            AcquireOutcome::Acquired(_) => acquired += 1,
            AcquireOutcome::Conflict => conflicts += 1,
        }
    }

    assert_eq!(acquired, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(ledger.executions_for("wf-race").len(), 1);
}

#[tokio::test]
async fn sequence_numbers_are_gap_free() {
    let ledger = MemoryLedger::new();
    ledger.upsert_workflow("wf-1", TENANT, Some(60));
    let scheduler = scheduler(&ledger);

    for round in 0..5i64 {
        let now = t0() + Duration::seconds(round * 60);
        let dispatched = scheduler.tick(now).await.expect("tick");
        assert_eq!(dispatched.len(), 1, "round {round} should lock one run");
        complete_success(
            &ledger,
            "wf-1",
            dispatched[0].execution_id,
            now + Duration::seconds(5),
        )
        .await;
    }

    let executions = ledger.executions_for("wf-1");
    let numbers: Vec<i32> = executions.iter().map(|e| e.execution_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    assert!(executions.iter().all(|e| e.status == ExecutionStatus::Success));
}

#[tokio::test]
async fn never_run_workflow_lifecycle() {
    let ledger = MemoryLedger::new();
    ledger.upsert_workflow("wf1", TENANT, Some(60));
    let scheduler = scheduler(&ledger);

    // First tick locks sequence 1.
    let dispatched = scheduler.tick(t0()).await.expect("tick");
    assert_eq!(
        dispatched,
        vec![DispatchedExecution {
            tenant_id: TENANT.to_string(),
            workflow_id: "wf1".to_string(),
            execution_id: dispatched[0].execution_id,
        }]
    );
    let execution = &ledger.executions_for("wf1")[0];
    assert_eq!(execution.execution_number, 1);
    assert_eq!(execution.status, ExecutionStatus::InProgress);
    assert_eq!(execution.triggered_by, "scheduler");
    assert_eq!(execution.started, t0());

    // The engine reports success five seconds in.
    complete_success(
        &ledger,
        "wf1",
        dispatched[0].execution_id,
        t0() + Duration::seconds(5),
    )
    .await;
    let execution = &ledger.executions_for("wf1")[0];
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.execution_time, Some(5));

    // Not due again after 30 seconds.
    let dispatched = scheduler.tick(t0() + Duration::seconds(30)).await.expect("tick");
    assert!(dispatched.is_empty());

    // Due after the interval elapses; sequence 2 is locked.
    let dispatched = scheduler.tick(t0() + Duration::seconds(65)).await.expect("tick");
    assert_eq!(dispatched.len(), 1);
    let executions = ledger.executions_for("wf1");
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[1].execution_number, 2);
    assert_eq!(executions[1].status, ExecutionStatus::InProgress);
}

#[tokio::test]
async fn due_boundary_is_inclusive() {
    let ledger = MemoryLedger::new();
    ledger.upsert_workflow("wf-1", TENANT, Some(300));
    let scheduler = scheduler(&ledger);

    let execution_id = acquire(&ledger, "wf-1", 1, t0()).await;
    complete_success(&ledger, "wf-1", execution_id, t0()).await;

    // One second short of the interval: not due.
    let dispatched = scheduler.tick(t0() + Duration::seconds(299)).await.expect("tick");
    assert!(dispatched.is_empty());

    // Exactly at the interval: due.
    let dispatched = scheduler.tick(t0() + Duration::seconds(300)).await.expect("tick");
    assert_eq!(dispatched.len(), 1);
    assert_eq!(ledger.executions_for("wf-1")[1].execution_number, 2);
}

#[tokio::test]
async fn stale_execution_is_reclaimed() {
    let ledger = MemoryLedger::new();
    ledger.upsert_workflow("wf-1", TENANT, Some(60));
    let scheduler = scheduler(&ledger);

    let first = acquire(&ledger, "wf-1", 1, t0()).await;
    complete_success(&ledger, "wf-1", first, t0() + Duration::seconds(1)).await;

    // Another instance acquired sequence 2 and then crashed.
    let crashed_at = t0() + Duration::seconds(60);
    acquire(&ledger, "wf-1", 2, crashed_at).await;

    // 61 minutes later the owner is presumed dead (threshold 60).
    let now = crashed_at + Duration::minutes(61);
    let dispatched = scheduler.tick(now).await.expect("tick");
    assert_eq!(dispatched.len(), 1);

    let executions = ledger.executions_for("wf-1");
    assert_eq!(executions.len(), 3);
    assert_eq!(executions[1].status, ExecutionStatus::Timeout);
    assert_eq!(executions[2].execution_number, 3);
    assert_eq!(executions[2].status, ExecutionStatus::InProgress);
    assert_eq!(dispatched[0].execution_id, executions[2].id);
}

#[tokio::test]
async fn running_execution_is_not_reclaimed() {
    let ledger = MemoryLedger::new();
    ledger.upsert_workflow("wf-1", TENANT, Some(60));
    let scheduler = scheduler(&ledger);

    let first = acquire(&ledger, "wf-1", 1, t0()).await;
    complete_success(&ledger, "wf-1", first, t0() + Duration::seconds(1)).await;

    // Sequence 2 is held by a healthy instance, five minutes in.
    let started = t0() + Duration::seconds(60);
    acquire(&ledger, "wf-1", 2, started).await;

    let dispatched = scheduler
        .tick(started + Duration::minutes(5))
        .await
        .expect("tick");
    assert!(dispatched.is_empty());
    assert_eq!(
        ledger.executions_for("wf-1")[1].status,
        ExecutionStatus::InProgress
    );
}

#[tokio::test]
async fn first_run_race_has_a_single_winner() {
    let ledger = MemoryLedger::new();
    ledger.upsert_workflow("wf2", TENANT, Some(60));

    // Two independent scheduler instances tick at the same instant.
    let instance_a = scheduler(&ledger);
    let instance_b = scheduler(&ledger);
    let (a, b) = tokio::join!(instance_a.tick(t0()), instance_b.tick(t0()));
    let a = a.expect("tick a");
    let b = b.expect("tick b");

    assert_eq!(a.len() + b.len(), 1, "exactly one instance wins the slot");
    let executions = ledger.executions_for("wf2");
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].execution_number, 1);
    assert_eq!(executions[0].status, ExecutionStatus::InProgress);
}

#[tokio::test]
async fn timed_out_slot_neither_advances_the_clock_nor_redispatches() {
    let ledger = MemoryLedger::new();
    ledger.upsert_workflow("wf-1", TENANT, Some(60));
    let scheduler = scheduler(&ledger);

    let first = acquire(&ledger, "wf-1", 1, t0()).await;
    complete_success(&ledger, "wf-1", first, t0()).await;

    // Sequence 2 timed out without anyone taking sequence 3.
    let second = acquire(&ledger, "wf-1", 2, t0() + Duration::seconds(60)).await;
    assert!(ledger.mark_timed_out(second).await.expect("mark"));

    // Due-ness is still computed from sequence 1 (timeout does not
    // count), so the scan contends for the occupied slot 2 and skips on
    // finding it terminal.
    let dispatched = scheduler.tick(t0() + Duration::seconds(120)).await.expect("tick");
    assert!(dispatched.is_empty());
    assert_eq!(ledger.executions_for("wf-1").len(), 2);
}

#[tokio::test]
async fn double_completion_is_rejected_and_row_unchanged() {
    let ledger = MemoryLedger::new();
    let execution_id = acquire(&ledger, "wf-1", 1, t0()).await;
    complete_success(&ledger, "wf-1", execution_id, t0() + Duration::seconds(5)).await;

    let err = ledger
        .complete(
            TENANT,
            "wf-1",
            execution_id,
            ExecutionStatus::Error,
            Some("late failure"),
            t0() + Duration::seconds(9),
        )
        .await
        .expect_err("second completion must fail");
    assert!(matches!(err, CompleteError::AlreadyFinished(id) if id == execution_id));

    let execution = &ledger.executions_for("wf-1")[0];
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.execution_time, Some(5));
    assert!(execution.error.is_none());
}

#[tokio::test]
async fn completion_for_the_wrong_tenant_is_rejected() {
    let ledger = MemoryLedger::new();
    let execution_id = acquire(&ledger, "wf-1", 1, t0()).await;

    let err = ledger
        .complete(
            "other-tenant",
            "wf-1",
            execution_id,
            ExecutionStatus::Success,
            None,
            t0(),
        )
        .await
        .expect_err("foreign tenant must not complete the run");
    assert!(matches!(err, CompleteError::NotFound(_)));

    let err = ledger
        .complete(
            TENANT,
            "wf-1",
            ExecutionId::new(),
            ExecutionStatus::Success,
            None,
            t0(),
        )
        .await
        .expect_err("unknown execution id");
    assert!(matches!(err, CompleteError::NotFound(_)));
}

#[tokio::test]
async fn completion_truncates_long_errors() {
    let ledger = MemoryLedger::new();
    let execution_id = acquire(&ledger, "wf-1", 1, t0()).await;

    let long_error = "provider exploded: ".to_string() + &"x".repeat(400);
    ledger
        .complete(
            TENANT,
            "wf-1",
            execution_id,
            ExecutionStatus::Error,
            Some(&long_error),
            t0() + Duration::seconds(12),
        )
        .await
        .expect("complete");

    let execution = &ledger.executions_for("wf-1")[0];
    assert_eq!(execution.status, ExecutionStatus::Error);
    assert_eq!(execution.execution_time, Some(12));
    let stored = execution.error.as_deref().expect("error stored");
    assert_eq!(stored.chars().count(), 255);
    assert!(stored.starts_with("provider exploded: "));
}

#[tokio::test]
async fn history_outside_the_lookback_window_is_ignored() {
    let ledger = MemoryLedger::new();
    ledger.upsert_workflow("wf-1", TENANT, Some(60));
    let scheduler = scheduler(&ledger);

    let execution_id = acquire(&ledger, "wf-1", 1, t0()).await;
    complete_success(&ledger, "wf-1", execution_id, t0()).await;

    // Eight days later the completed run has aged out of the window, so
    // the workflow counts as never-run; its first slot is already taken,
    // and the conflict only skips.
    let dispatched = scheduler.tick(t0() + Duration::days(8)).await.expect("tick");
    assert!(dispatched.is_empty());
    assert_eq!(ledger.executions_for("wf-1").len(), 1);
}

#[tokio::test]
async fn intermediate_results_share_the_execution_row() {
    let ledger = MemoryLedger::new();
    let execution_id = acquire(&ledger, "wf-1", 1, t0()).await;

    ledger
        .record_results(
            TENANT,
            "wf-1",
            execution_id,
            json!({"step-1": {"status": "ok"}}),
        )
        .await
        .expect("record results");

    let execution = ledger
        .get_execution(TENANT, "wf-1", execution_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(
        execution.results,
        Some(json!({"step-1": {"status": "ok"}}))
    );

    let err = ledger
        .record_results(TENANT, "wf-1", ExecutionId::new(), json!({}))
        .await
        .expect_err("unknown execution id");
    assert!(matches!(err, CompleteError::NotFound(_)));
}

#[tokio::test]
async fn recent_executions_list_newest_first() {
    let ledger = MemoryLedger::new();
    let first = acquire(&ledger, "wf-1", 1, t0()).await;
    complete_success(&ledger, "wf-1", first, t0() + Duration::seconds(2)).await;
    acquire(&ledger, "wf-1", 2, t0() + Duration::seconds(60)).await;

    let recent = ledger
        .list_recent_executions(TENANT, "wf-1", t0() - Duration::days(7), 50)
        .await
        .expect("list");
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].execution_number, 2);
    assert_eq!(recent[1].execution_number, 1);

    let limited = ledger
        .list_recent_executions(TENANT, "wf-1", t0() - Duration::days(7), 1)
        .await
        .expect("list");
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].execution_number, 2);
}

#[tokio::test]
async fn scan_covers_all_tenants_unless_scoped() {
    let ledger = MemoryLedger::new();
    ledger.upsert_workflow("wf-a", "tenant-1", Some(60));
    ledger.upsert_workflow("wf-b", "tenant-2", Some(60));

    let dispatched = scheduler(&ledger).tick(t0()).await.expect("tick");
    assert_eq!(dispatched.len(), 2);

    let ledger = MemoryLedger::new();
    ledger.upsert_workflow("wf-a", "tenant-1", Some(60));
    ledger.upsert_workflow("wf-b", "tenant-2", Some(60));
    let scoped = WorkflowScheduler::new(
        ledger.clone(),
        SchedulerConfig {
            tenant_scope: Some("tenant-2".to_string()),
            ..test_config()
        },
    );
    let dispatched = scoped.tick(t0()).await.expect("tick");
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].workflow_id, "wf-b");
}

// ============================================================================
// Ledger-inconsistency arbitration
// ============================================================================

/// Ledger double that reports a conflict while refusing to show the
/// conflicting row, the anomaly the scan must survive without inventing
/// state.
#[derive(Clone)]
struct VanishingRowLedger {
    inner: MemoryLedger,
}

#[async_trait]
impl ExecutionLedger for VanishingRowLedger {
    async fn list_active_workflows(
        &self,
        tenant_scope: Option<&str>,
    ) -> LedgerResult<Vec<WorkflowRef>> {
        self.inner.list_active_workflows(tenant_scope).await
    }

    async fn try_acquire(
        &self,
        _request: &AcquireRequest,
        _now: DateTime<Utc>,
    ) -> LedgerResult<AcquireOutcome> {
        Ok(AcquireOutcome::Conflict)
    }

    async fn last_completed(
        &self,
        workflow_id: &str,
        since: DateTime<Utc>,
    ) -> LedgerResult<Option<WorkflowExecution>> {
        self.inner.last_completed(workflow_id, since).await
    }

    async fn execution_by_number(
        &self,
        _workflow_id: &str,
        _execution_number: i32,
    ) -> LedgerResult<Option<WorkflowExecution>> {
        Ok(None)
    }

    async fn mark_timed_out(&self, execution_id: ExecutionId) -> LedgerResult<bool> {
        self.inner.mark_timed_out(execution_id).await
    }

    async fn complete(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), CompleteError> {
        self.inner
            .complete(tenant_id, workflow_id, execution_id, status, error, now)
            .await
    }

    async fn record_results(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        execution_id: ExecutionId,
        results: serde_json::Value,
    ) -> Result<(), CompleteError> {
        self.inner
            .record_results(tenant_id, workflow_id, execution_id, results)
            .await
    }

    async fn get_execution(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        execution_id: ExecutionId,
    ) -> LedgerResult<Option<WorkflowExecution>> {
        self.inner
            .get_execution(tenant_id, workflow_id, execution_id)
            .await
    }

    async fn list_recent_executions(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<WorkflowExecution>> {
        self.inner
            .list_recent_executions(tenant_id, workflow_id, since, limit)
            .await
    }
}

#[tokio::test]
async fn conflict_without_visible_row_skips_the_workflow() {
    let inner = MemoryLedger::new();
    inner.upsert_workflow("wf-1", TENANT, Some(60));

    // Anchor a completed run so the scan takes the incremented path,
    // where a conflict triggers the re-read.
    let execution_id = acquire(&inner, "wf-1", 1, t0()).await;
    complete_success(&inner, "wf-1", execution_id, t0()).await;

    let scheduler = WorkflowScheduler::new(VanishingRowLedger { inner }, test_config());
    let dispatched = scheduler
        .tick(t0() + Duration::seconds(120))
        .await
        .expect("tick survives the anomaly");
    assert!(dispatched.is_empty());
}

// ============================================================================
// Background task
// ============================================================================

#[tokio::test]
async fn scheduler_task_dispatches_and_shuts_down() {
    let ledger = MemoryLedger::new();
    ledger.upsert_workflow("wf-1", TENANT, Some(60));

    let (dispatch_tx, mut dispatch_rx) = tokio::sync::mpsc::channel(16);
    let config = SchedulerConfig {
        poll_interval: std::time::Duration::from_millis(10),
        ..test_config()
    };
    let (handle, shutdown_tx) = spawn_scheduler(ledger.clone(), config, dispatch_tx);

    let dispatched = tokio::time::timeout(std::time::Duration::from_secs(5), dispatch_rx.recv())
        .await
        .expect("dispatch within timeout")
        .expect("channel open");
    assert_eq!(dispatched.workflow_id, "wf-1");
    assert_eq!(dispatched.tenant_id, TENANT);
    assert_eq!(
        ledger.executions_for("wf-1")[0].id,
        dispatched.execution_id
    );

    shutdown_tx.send(true).expect("signal shutdown");
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("task stops after shutdown")
        .expect("task join");
}
