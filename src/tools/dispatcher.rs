//! Tool dispatcher: invokes requested tool calls and turns every outcome,
//! including failures, into a tool result the decision step can read.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt, stream};
use serde::Serialize;
use tracing::{debug, warn};

use crate::llm::ToolCall;
use crate::tools::registry::ToolRegistry;
use crate::tools::tool::ToolContext;

/// Reason code carried by an error tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorCode {
    /// No tool is registered under the requested name.
    UnknownTool,
    /// The tool returned an error.
    InvocationFailed,
    /// The tool did not finish within its execution timeout.
    Timeout,
    /// The tool panicked.
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Ok {
        output: serde_json::Value,
    },
    Error {
        code: ToolErrorCode,
        message: String,
    },
}

/// Result of one dispatched call.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub call_id: String,
    pub name: String,
    pub outcome: ToolOutcome,
    pub duration: Duration,
}

impl ToolCallResult {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error { .. })
    }

    pub fn error_code(&self) -> Option<ToolErrorCode> {
        match &self.outcome {
            ToolOutcome::Error { code, .. } => Some(*code),
            ToolOutcome::Ok { .. } => None,
        }
    }

    /// Text placed in the tool-result message.
    pub fn content(&self) -> String {
        match &self.outcome {
            ToolOutcome::Ok {
                output: serde_json::Value::String(s),
            } => s.clone(),
            ToolOutcome::Ok { output } => {
                serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string())
            }
            ToolOutcome::Error { code, message } => serde_json::json!({
                "error": { "code": code, "message": message }
            })
            .to_string(),
        }
    }
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    max_concurrency: usize,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, max_concurrency: usize) -> Self {
        Self {
            registry,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run every call, at most `max_concurrency` at a time, and return the
    /// results in request order once all of them have finished.
    pub async fn dispatch(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolCallResult> {
        // Owned inputs keep the buffered stream `Send` for spawned callers.
        let pending: Vec<_> = calls
            .iter()
            .map(|call| dispatch_one(Arc::clone(&self.registry), call.clone(), ctx.clone()))
            .collect();
        stream::iter(pending)
            .buffered(self.max_concurrency)
            .collect()
            .await
    }
}

async fn dispatch_one(
    registry: Arc<ToolRegistry>,
    call: ToolCall,
    ctx: ToolContext,
) -> ToolCallResult {
    let start = Instant::now();
    let finish = |outcome: ToolOutcome| ToolCallResult {
        call_id: call.id.clone(),
        name: call.name.clone(),
        outcome,
        duration: start.elapsed(),
    };

    let Some(tool) = registry.get(&call.name).await else {
        warn!(tool = %call.name, thread = %ctx.thread_id, "Unknown tool requested");
        return finish(ToolOutcome::Error {
            code: ToolErrorCode::UnknownTool,
            message: format!("No tool named '{}' is registered", call.name),
        });
    };

    debug!(tool = %call.name, params = %call.arguments, "Tool call started");

    let tool_timeout = tool.execution_timeout();
    let result = tokio::time::timeout(
        tool_timeout,
        AssertUnwindSafe(tool.execute(call.arguments.clone(), &ctx)).catch_unwind(),
    )
    .await;

    let outcome = match result {
        Ok(Ok(Ok(output))) => ToolOutcome::Ok {
            output: output.result,
        },
        Ok(Ok(Err(e))) => ToolOutcome::Error {
            code: ToolErrorCode::InvocationFailed,
            message: e.to_string(),
        },
        Ok(Err(panic)) => ToolOutcome::Error {
            code: ToolErrorCode::Panicked,
            message: panic_message(panic.as_ref()),
        },
        Err(_) => ToolOutcome::Error {
            code: ToolErrorCode::Timeout,
            message: format!("Tool timed out after {}s", tool_timeout.as_secs_f64()),
        },
    };

    let result = finish(outcome);
    if let ToolOutcome::Error { code, message } = &result.outcome {
        warn!(
            tool = %call.name,
            elapsed_ms = result.duration.as_millis() as u64,
            ?code,
            error = %message,
            "Tool call failed"
        );
    } else {
        debug!(
            tool = %call.name,
            elapsed_ms = result.duration.as_millis() as u64,
            "Tool call succeeded"
        );
    }
    result
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Tool panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Tool panicked: {s}")
    } else {
        "Tool panicked".to_string()
    }
}
