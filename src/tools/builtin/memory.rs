//! Memory tools backed by the run's memory session.

use std::time::Instant;

use async_trait::async_trait;

use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

fn session(
    ctx: &ToolContext,
) -> Result<&std::sync::Arc<dyn crate::memory::MemorySession>, ToolError> {
    ctx.memory
        .as_ref()
        .ok_or_else(|| ToolError::Unavailable("no memory session is open for this run".into()))
}

// ── memory_search ───────────────────────────────────────────────────

/// Tool for searching stored memories.
pub struct MemorySearchTool;

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search past memories for earlier decisions, handled items and context. \
         Call before acting on something you may have handled already."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Text to look for"
                },
                "limit": {
                    "type": "integer",
                    "description": "Max results (default: 5, max: 20)",
                    "default": 5
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let query = require_str(&params, "query")?;
        let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(5).min(20) as usize;

        let results = session(ctx)?
            .search(query, limit)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Search failed: {e}")))?;

        let output = serde_json::json!({
            "query": query,
            "results": results,
            "result_count": results.len(),
        });
        Ok(ToolOutput::success(output, start.elapsed()))
    }
}

// ── memory_insert ───────────────────────────────────────────────────

/// Tool for storing a new memory.
pub struct MemoryInsertTool;

#[async_trait]
impl Tool for MemoryInsertTool {
    fn name(&self) -> &str {
        "memory_insert"
    }

    fn description(&self) -> &str {
        "Store something worth remembering in later runs: a decision, \
         an item you handled, or context you will need again."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "What to remember" }
            },
            "required": ["content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let content = require_str(&params, "content")?;
        if content.trim().is_empty() {
            return Err(ToolError::InvalidParameters("content cannot be empty".into()));
        }

        let entry = session(ctx)?
            .insert(content)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Write failed: {e}")))?;

        Ok(ToolOutput::success(
            serde_json::json!({ "id": entry.id, "stored": true }),
            start.elapsed(),
        ))
    }
}
