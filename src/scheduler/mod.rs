//! Durable task scheduling: the task model, the single-flight claim and the
//! per-namespace polling loops.

pub mod executor;
pub mod queue;
pub mod task;

pub use executor::{NamespaceLoops, TaskExecutor, spawn_namespace_loops};
pub use queue::{
    MAX_COMPLETED_TASKS, MAX_SCHEDULE_DELAY, MAX_SCHEDULED_TASKS, TaskEvent, TaskQueueSnapshot, TaskScheduler,
};
pub use task::{StatusUpdate, Task, TaskStatus};
