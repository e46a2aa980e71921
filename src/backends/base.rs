//! Ledger models and backend interfaces for execution locking.
//!
//! The execution ledger is the only shared mutable resource in the
//! scheduler. Its uniqueness constraint over
//! `(workflow_id, execution_number)` doubles as the lock: creating the
//! row for a sequence number acquires that run, and a conflict means
//! another scheduler instance already owns it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Maximum stored length for `triggered_by` and `error` text.
pub const MAX_LABEL_LEN: usize = 255;

/// Caller label recorded on executions created by the due scan.
pub const TRIGGERED_BY_SCHEDULER: &str = "scheduler";

/// Truncate free-text fields to the ledger column size.
pub fn truncate_label(value: &str) -> String {
    value.chars().take(MAX_LABEL_LEN).collect()
}

// ============================================================================
// Identifiers & Status
// ============================================================================

/// Unique identifier for a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    InProgress,
    Success,
    Error,
    ProvidersNotConfigured,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Error => "error",
            Self::ProvidersNotConfigured => "providers_not_configured",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "providers_not_configured" => Some(Self::ProvidersNotConfigured),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// An execution in a terminal status is never mutated again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Terminal statuses that advance the workflow's interval clock.
    ///
    /// `Timeout` is terminal but deliberately excluded: a timed-out run
    /// does not count as the last completed execution when computing
    /// when the workflow is next due.
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::ProvidersNotConfigured
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Models
// ============================================================================

/// What the due scan reads from the external workflow-definition store:
/// a non-deleted workflow with a positive interval.
#[derive(Debug, Clone)]
pub struct WorkflowRef {
    pub id: String,
    pub tenant_id: String,
    /// Scheduling interval in seconds.
    pub interval: i64,
}

/// One attempt to run a workflow, uniquely keyed by
/// `(workflow_id, execution_number)`.
#[derive(Debug, Clone)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: String,
    pub tenant_id: String,
    pub execution_number: i32,
    pub status: ExecutionStatus,
    pub started: DateTime<Utc>,
    pub triggered_by: String,
    pub error: Option<String>,
    /// Elapsed whole seconds, set at completion.
    pub execution_time: Option<i64>,
    /// Intermediate step results reported by the execution engine.
    pub results: Option<Value>,
}

/// Alert event that triggered an execution, when the trigger was not the
/// interval clock.
#[derive(Debug, Clone)]
pub struct AlertOrigin {
    pub fingerprint: String,
    pub event_id: Option<String>,
}

/// Stored association between an execution and its originating alert.
#[derive(Debug, Clone)]
pub struct AlertLink {
    pub execution_id: ExecutionId,
    pub alert_fingerprint: String,
    pub event_id: Option<String>,
}

/// Parameters for acquiring an execution slot.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub workflow_id: String,
    pub tenant_id: String,
    pub triggered_by: String,
    pub execution_number: i32,
    pub origin: Option<AlertOrigin>,
}

impl AcquireRequest {
    /// Request for an interval-clock run created by the due scan.
    pub fn scheduled(workflow: &WorkflowRef, execution_number: i32) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            tenant_id: workflow.tenant_id.clone(),
            triggered_by: TRIGGERED_BY_SCHEDULER.to_string(),
            execution_number,
            origin: None,
        }
    }
}

/// Result of a lock acquisition attempt.
///
/// Contention is an expected outcome, not a fault: a `Conflict` means the
/// uniqueness constraint rejected the insert because another instance
/// already created that `(workflow_id, execution_number)` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(ExecutionId),
    Conflict,
}

/// Handoff payload for an execution locked this tick. The external
/// execution engine runs it and reports back through
/// [`ExecutionLedger::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedExecution {
    pub tenant_id: String,
    pub workflow_id: String,
    pub execution_id: ExecutionId,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Caller misuse of the completion path. Completing an execution that is
/// already terminal, or one that does not belong to the given tenant and
/// workflow, is a bug in the caller and is never retried.
#[derive(Debug, Error)]
pub enum CompleteError {
    #[error("execution not found: {0}")]
    NotFound(ExecutionId),
    #[error("execution already finished: {0}")]
    AlreadyFinished(ExecutionId),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

// ============================================================================
// Ledger trait
// ============================================================================

/// Durable execution ledger. Every method is one short, independent
/// transaction; no in-process view of lock ownership is ever cached, so
/// each scheduling decision re-reads the ledger.
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// Non-deleted workflows with a positive interval, optionally scoped
    /// to one tenant.
    async fn list_active_workflows(
        &self,
        tenant_scope: Option<&str>,
    ) -> LedgerResult<Vec<WorkflowRef>>;

    /// Create-if-absent insert of a new `in_progress` execution at the
    /// requested sequence number. First writer wins; everyone else gets
    /// [`AcquireOutcome::Conflict`]. When the request carries an alert
    /// origin, the link row is written in the same transaction.
    async fn try_acquire(
        &self,
        request: &AcquireRequest,
        now: DateTime<Utc>,
    ) -> LedgerResult<AcquireOutcome>;

    /// The highest-numbered completed execution started at or after
    /// `since`. Timed-out runs do not count (see
    /// [`ExecutionStatus::is_completed`]); anything older than `since`
    /// is out of the lookback window and the workflow is treated as
    /// never-run.
    async fn last_completed(
        &self,
        workflow_id: &str,
        since: DateTime<Utc>,
    ) -> LedgerResult<Option<WorkflowExecution>>;

    /// Re-read the execution occupying a sequence-number slot after a
    /// conflict.
    async fn execution_by_number(
        &self,
        workflow_id: &str,
        execution_number: i32,
    ) -> LedgerResult<Option<WorkflowExecution>>;

    /// Transition an execution from `in_progress` to `timeout`. Returns
    /// whether this caller made the transition; a row that is already
    /// terminal is left untouched.
    async fn mark_timed_out(&self, execution_id: ExecutionId) -> LedgerResult<bool>;

    /// Record the terminal outcome of a run: status, truncated error and
    /// `execution_time = now - started` in whole seconds. Writes exactly
    /// once; a second completion is caller misuse.
    async fn complete(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), CompleteError>;

    /// Store intermediate step results on the execution row. Shares the
    /// row with the locking protocol but not the lock itself.
    async fn record_results(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        execution_id: ExecutionId,
        results: Value,
    ) -> Result<(), CompleteError>;

    /// Read one execution, scoped to its tenant and workflow.
    async fn get_execution(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        execution_id: ExecutionId,
    ) -> LedgerResult<Option<WorkflowExecution>>;

    /// Recent executions for a workflow, newest first.
    async fn list_recent_executions(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<WorkflowExecution>>;
}

// ============================================================================
// Tests
// ============================================================================
