//! Recurring-workflow scheduling: the due scan and its background task.

mod scan;
mod task;

pub use scan::{SchedulerConfig, WorkflowScheduler};
pub use task::{SchedulerTask, spawn_scheduler};
