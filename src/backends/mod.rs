//! Ledger implementations for execution persistence.

mod base;
mod memory;
mod postgres;

pub use base::{
    AcquireOutcome, AcquireRequest, AlertLink, AlertOrigin, CompleteError, DispatchedExecution,
    ExecutionId, ExecutionLedger, ExecutionStatus, LedgerError, LedgerResult, MAX_LABEL_LEN,
    TRIGGERED_BY_SCHEDULER, WorkflowExecution, WorkflowRef, truncate_label,
};
pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;
