//! `thinking`: lets the model write down a reasoning step as a tool call.

use std::time::Instant;

use async_trait::async_trait;

use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

pub struct ThinkingTool;

#[async_trait]
impl Tool for ThinkingTool {
    fn name(&self) -> &str {
        "thinking"
    }

    fn description(&self) -> &str {
        "Think through a problem step by step before acting. \
         The thought is recorded in the conversation and nothing else happens."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "thought": { "type": "string", "description": "Your reasoning" }
            },
            "required": ["thought"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let thought = require_str(&params, "thought")?;
        tracing::debug!(thread = %ctx.thread_id, "thinking: {}", thought);
        Ok(ToolOutput::text(thought, start.elapsed()))
    }
}
