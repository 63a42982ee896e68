//! Prompt text for the workflow steps.

use crate::llm::{ChatMessage, Role};

pub const STOP_TOOL_NAME: &str = "stop_workflow";

pub const STOP_TOOL_DESCRIPTION: &str = "End the current workflow. Call this when the task is \
     done, when nothing useful is left to do, or when you are blocked. Give the reason.";

pub const DECISION_GUIDANCE: &str = "You run as an autonomous agent. Work on the task step by \
     step using the tools available. Call several tools at once when they are independent. \
     When the task is complete or cannot progress, call stop_workflow with a short reason.";

pub const SUMMARY_INSTRUCTIONS: &str = "Summarize the conversation excerpt below for your own \
     later use. Keep every decision, every external item id you handled, tool outcomes that \
     matter, and open follow-ups. Be concise. Reply with the summary only.";

pub const FINISH_INSTRUCTIONS: &str = "The workflow has ended. Review the transcript below and \
     reply with a single JSON object and nothing else:\n\
     {\"summary\": \"what was done and what was learned\", \
     \"schedule\": {\"nextWorkflowPrompt\": \"instruction for the next run\", \
     \"secondsUntilNextWorkflow\": 3600}}\n\
     Omit \"schedule\" when no follow-up run is needed.";

/// Render messages as a plain transcript, one entry per message.
pub fn transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let mut line = format!("{role}: {}", msg.content);
            for call in &msg.tool_calls {
                line.push_str(&format!("\n  -> {}({})", call.name, call.arguments));
            }
            if let Some(name) = &msg.name {
                line = format!("{role} [{name}]: {}", msg.content);
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
