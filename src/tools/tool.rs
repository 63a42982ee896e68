//! Tool trait and the context a tool runs in.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::memory::MemorySession;

/// Errors a tool may return. The dispatcher turns every one of them into an
/// error tool result; none of them abort the run.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),
}

/// Successful tool output.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    #[serde(skip)]
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }
}

/// Per-run state handed to every tool call.
#[derive(Clone)]
pub struct ToolContext {
    pub namespace: String,
    pub thread_id: String,
    /// The run's memory session, if one is open.
    pub memory: Option<Arc<dyn MemorySession>>,
    /// External item ids already handled in this run.
    pub processed_ids: Arc<Mutex<HashSet<String>>>,
}

impl ToolContext {
    pub fn new(namespace: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            thread_id: thread_id.into(),
            memory: None,
            processed_ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemorySession>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Record an item as handled. Returns `false` if it already was.
    pub fn mark_processed(&self, id: impl Into<String>) -> bool {
        match self.processed_ids.lock() {
            Ok(mut ids) => ids.insert(id.into()),
            Err(poisoned) => poisoned.into_inner().insert(id.into()),
        }
    }

    pub fn is_processed(&self, id: &str) -> bool {
        match self.processed_ids.lock() {
            Ok(ids) => ids.contains(id),
            Err(poisoned) => poisoned.into_inner().contains(id),
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("namespace", &self.namespace)
            .field("thread_id", &self.thread_id)
            .field("has_memory", &self.memory.is_some())
            .finish()
    }
}

/// An external capability invocable by name with structured arguments.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments.
    fn parameters_schema(&self) -> serde_json::Value;

    /// How long a single call may take before it is abandoned.
    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

/// Extract a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing string parameter '{key}'")))
}
