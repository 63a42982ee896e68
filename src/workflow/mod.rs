//! The workflow state machine: conversation window, states, payloads and
//! the engine that drives a run.

pub mod conversation;
pub mod engine;
pub mod payload;
pub mod state;
pub mod steps;

pub use conversation::{ConversationWindow, SUMMARY_PREFIX};
pub use engine::{WorkflowEngine, next_thread_id};
pub use payload::{Decision, FinishedWorkflow, RunOutcome, WorkflowControl};
pub use state::{Effect, Node, transition};
pub use steps::{DecisionStep, FinishStep, SummaryStep, WorkflowSteps};
