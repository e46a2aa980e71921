//! Ratchet - multi-tenant recurring workflow scheduling on a ledger lock.
//!
//! Multiple scheduler instances poll independently; the only coordination
//! primitive is the execution ledger's uniqueness constraint over
//! `(workflow_id, execution_number)`. Acquiring a run means inserting its
//! row; losing the race means observing a conflict and re-reading the
//! ledger to decide between "someone else is running it" and "the owner
//! crashed, reclaim it".

pub mod backends;
pub mod config;
pub mod scheduler;

pub use backends::{
    AcquireOutcome, AcquireRequest, AlertLink, AlertOrigin, CompleteError, DispatchedExecution,
    ExecutionId, ExecutionLedger, ExecutionStatus, LedgerError, LedgerResult, MemoryLedger,
    PostgresLedger, WorkflowExecution, WorkflowRef,
};
pub use config::Config;
pub use scheduler::{SchedulerConfig, SchedulerTask, WorkflowScheduler, spawn_scheduler};
