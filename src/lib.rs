//! Agent orchestrator: a durable, namespace-partitioned task scheduler
//! feeding a bounded workflow state machine.

pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod tools;
pub mod workflow;
