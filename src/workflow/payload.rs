//! Typed payloads passed between workflow states.

use serde::{Deserialize, Serialize};

use crate::llm::ToolCall;

/// What the decision step wants to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Call one or more tools.
    ToolCalls {
        content: Option<String>,
        calls: Vec<ToolCall>,
    },
    /// End the run.
    Stop { reason: String },
    /// Plain text without tool calls or a stop signal.
    Respond { content: String },
}

/// Run-internal stop signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowControl {
    pub should_stop: bool,
    pub reason: Option<String>,
}

impl WorkflowControl {
    pub fn stop(&mut self, reason: impl Into<String>) {
        self.should_stop = true;
        self.reason = Some(reason.into());
    }
}

/// Outcome of a finished run, stored as the task result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedWorkflow {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_workflow_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_until_next_workflow: Option<u64>,
}

impl FinishedWorkflow {
    pub fn summary_only(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            next_workflow_prompt: None,
            seconds_until_next_workflow: None,
        }
    }
}

/// Statistics about a completed run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub thread_id: String,
    pub finished: FinishedWorkflow,
    pub stop_reason: Option<String>,
    pub input_visits: u32,
    pub tool_calls: usize,
    pub prunes: usize,
}
