//! In-memory ledger for tests and local runs.
//!
//! A single mutex guards the whole state, so a create-if-absent insert is
//! atomic and concurrent acquire calls arbitrate exactly one winner, the
//! same guarantee the Postgres uniqueness constraint provides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::base::{
    AcquireOutcome, AcquireRequest, AlertLink, CompleteError, ExecutionId, ExecutionLedger,
    ExecutionStatus, LedgerResult, WorkflowExecution, WorkflowRef, truncate_label,
};

#[derive(Debug, Clone)]
struct StoredWorkflow {
    id: String,
    tenant_id: String,
    interval: Option<i64>,
    is_deleted: bool,
}

/// Slot key: the uniqueness constraint over (workflow_id, execution_number).
type SlotKey = (String, i32);

#[derive(Default)]
struct LedgerState {
    workflows: Vec<StoredWorkflow>,
    slots: HashMap<SlotKey, WorkflowExecution>,
    by_id: HashMap<ExecutionId, SlotKey>,
    alert_links: Vec<AlertLink>,
}

/// Ledger that stores workflows and executions in memory.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a workflow definition. `interval` of `None`
    /// or zero means the workflow is not scheduled.
    pub fn upsert_workflow(&self, id: &str, tenant_id: &str, interval: Option<i64>) {
        let mut state = self.state.lock().expect("ledger state poisoned");
        let workflow = StoredWorkflow {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            interval,
            is_deleted: false,
        };
        match state.workflows.iter_mut().find(|w| w.id == id) {
            Some(existing) => *existing = workflow,
            None => state.workflows.push(workflow),
        }
    }

    /// Soft-delete a workflow so the scan no longer sees it.
    pub fn delete_workflow(&self, id: &str) {
        let mut state = self.state.lock().expect("ledger state poisoned");
        if let Some(workflow) = state.workflows.iter_mut().find(|w| w.id == id) {
            workflow.is_deleted = true;
        }
    }

    /// All executions for a workflow, ordered by sequence number.
    pub fn executions_for(&self, workflow_id: &str) -> Vec<WorkflowExecution> {
        let state = self.state.lock().expect("ledger state poisoned");
        let mut executions: Vec<_> = state
            .slots
            .values()
            .filter(|execution| execution.workflow_id == workflow_id)
            .cloned()
            .collect();
        executions.sort_by_key(|execution| execution.execution_number);
        executions
    }

    pub fn alert_links(&self) -> Vec<AlertLink> {
        self.state
            .lock()
            .expect("ledger state poisoned")
            .alert_links
            .clone()
    }
}

#[async_trait]
impl ExecutionLedger for MemoryLedger {
    async fn list_active_workflows(
        &self,
        tenant_scope: Option<&str>,
    ) -> LedgerResult<Vec<WorkflowRef>> {
        let state = self.state.lock().expect("ledger state poisoned");
        Ok(state
            .workflows
            .iter()
            .filter(|workflow| !workflow.is_deleted)
            .filter(|workflow| workflow.interval.is_some_and(|interval| interval > 0))
            .filter(|workflow| {
                tenant_scope.is_none_or(|tenant| workflow.tenant_id == tenant)
            })
            .map(|workflow| WorkflowRef {
                id: workflow.id.clone(),
                tenant_id: workflow.tenant_id.clone(),
                interval: workflow.interval.unwrap_or(0),
            })
            .collect())
    }

    async fn try_acquire(
        &self,
        request: &AcquireRequest,
        now: DateTime<Utc>,
    ) -> LedgerResult<AcquireOutcome> {
        let mut state = self.state.lock().expect("ledger state poisoned");
        let key = (request.workflow_id.clone(), request.execution_number);
        if state.slots.contains_key(&key) {
            return Ok(AcquireOutcome::Conflict);
        }

        let execution = WorkflowExecution {
            id: ExecutionId::new(),
            workflow_id: request.workflow_id.clone(),
            tenant_id: request.tenant_id.clone(),
            execution_number: request.execution_number,
            status: ExecutionStatus::InProgress,
            started: now,
            triggered_by: truncate_label(&request.triggered_by),
            error: None,
            execution_time: None,
            results: None,
        };
        let execution_id = execution.id;
        state.by_id.insert(execution_id, key.clone());
        state.slots.insert(key, execution);
        if let Some(origin) = &request.origin {
            state.alert_links.push(AlertLink {
                execution_id,
                alert_fingerprint: origin.fingerprint.clone(),
                event_id: origin.event_id.clone(),
            });
        }
        Ok(AcquireOutcome::Acquired(execution_id))
    }

    async fn last_completed(
        &self,
        workflow_id: &str,
        since: DateTime<Utc>,
    ) -> LedgerResult<Option<WorkflowExecution>> {
        let state = self.state.lock().expect("ledger state poisoned");
        Ok(state
            .slots
            .values()
            .filter(|execution| execution.workflow_id == workflow_id)
            .filter(|execution| execution.status.is_completed())
            .filter(|execution| execution.started >= since)
            .max_by_key(|execution| execution.execution_number)
            .cloned())
    }

    async fn execution_by_number(
        &self,
        workflow_id: &str,
        execution_number: i32,
    ) -> LedgerResult<Option<WorkflowExecution>> {
        let state = self.state.lock().expect("ledger state poisoned");
        Ok(state
            .slots
            .get(&(workflow_id.to_string(), execution_number))
            .cloned())
    }

    async fn mark_timed_out(&self, execution_id: ExecutionId) -> LedgerResult<bool> {
        let mut state = self.state.lock().expect("ledger state poisoned");
        let Some(key) = state.by_id.get(&execution_id).cloned() else {
            return Ok(false);
        };
        let Some(execution) = state.slots.get_mut(&key) else {
            return Ok(false);
        };
        if execution.status != ExecutionStatus::InProgress {
            return Ok(false);
        }
        execution.status = ExecutionStatus::Timeout;
        Ok(true)
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
        let mut state = self.state.lock().expect("ledger state poisoned");
        let key = state
            .by_id
            .get(&execution_id)
            .cloned()
            .ok_or(CompleteError::NotFound(execution_id))?;
        let execution = state
            .slots
            .get_mut(&key)
            .ok_or(CompleteError::NotFound(execution_id))?;
        if execution.tenant_id != tenant_id || execution.workflow_id != workflow_id {
            return Err(CompleteError::NotFound(execution_id));
        }
        if execution.status.is_terminal() {
            return Err(CompleteError::AlreadyFinished(execution_id));
        }
        execution.status = status;
        execution.error = error.map(truncate_label);
        execution.execution_time = Some((now - execution.started).num_seconds());
        Ok(())
    }

    async fn record_results(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        execution_id: ExecutionId,
        results: Value,
    ) -> Result<(), CompleteError> {
        let mut state = self.state.lock().expect("ledger state poisoned");
        let key = state
            .by_id
            .get(&execution_id)
            .cloned()
            .ok_or(CompleteError::NotFound(execution_id))?;
        let execution = state
            .slots
            .get_mut(&key)
            .ok_or(CompleteError::NotFound(execution_id))?;
        if execution.tenant_id != tenant_id || execution.workflow_id != workflow_id {
            return Err(CompleteError::NotFound(execution_id));
        }
        execution.results = Some(results);
        Ok(())
    }

    async fn get_execution(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        execution_id: ExecutionId,
    ) -> LedgerResult<Option<WorkflowExecution>> {
        let state = self.state.lock().expect("ledger state poisoned");
        let Some(key) = state.by_id.get(&execution_id) else {
            return Ok(None);
        };
        Ok(state
            .slots
            .get(key)
            .filter(|execution| {
                execution.tenant_id == tenant_id && execution.workflow_id == workflow_id
            })
            .cloned())
    }

    async fn list_recent_executions(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<WorkflowExecution>> {
        let state = self.state.lock().expect("ledger state poisoned");
        let mut executions: Vec<_> = state
            .slots
            .values()
            .filter(|execution| {
                execution.tenant_id == tenant_id && execution.workflow_id == workflow_id
            })
            .filter(|execution| execution.started >= since)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.started.cmp(&a.started));
        executions.truncate(limit.max(0) as usize);
        Ok(executions)
    }
}
