//! The external LLM collaborators the engine calls into.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::{ChatMessage, ToolDefinition};
use crate::workflow::payload::{Decision, FinishedWorkflow, WorkflowControl};

/// Decides the next action from the current window.
#[async_trait]
pub trait DecisionStep: Send + Sync {
    async fn decide(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Decision, LlmError>;
}

/// Condenses a block of old messages into text.
#[async_trait]
pub trait SummaryStep: Send + Sync {
    async fn summarize(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

/// Condenses a finished run into its result.
#[async_trait]
pub trait FinishStep: Send + Sync {
    async fn finish(
        &self,
        messages: &[ChatMessage],
        control: &WorkflowControl,
    ) -> Result<FinishedWorkflow, LlmError>;
}

/// The three steps a run needs.
#[derive(Clone)]
pub struct WorkflowSteps {
    pub decision: Arc<dyn DecisionStep>,
    pub summary: Arc<dyn SummaryStep>,
    pub finish: Arc<dyn FinishStep>,
}

impl WorkflowSteps {
    /// Use one value for all three steps.
    pub fn from_single<S>(steps: Arc<S>) -> Self
    where
        S: DecisionStep + SummaryStep + FinishStep + 'static,
    {
        Self {
            decision: steps.clone(),
            summary: steps.clone(),
            finish: steps,
        }
    }
}
