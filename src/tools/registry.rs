//! Tool registry for managing available tools.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::llm::ToolDefinition;
use crate::llm::prompts::STOP_TOOL_NAME;
use crate::tools::tool::Tool;

/// Names that dynamic registrations may not take over.
pub const PROTECTED_TOOL_NAMES: &[&str] = &[
    STOP_TOOL_NAME,
    "thinking",
    "scheduler_add_task",
    "scheduler_delete_task",
    "scheduler_get_scheduled_tasks",
    "scheduler_get_completed_tasks",
    "memory_search",
    "memory_insert",
];

/// Tools the decision step may call, keyed by name.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    /// Protected names taken by a built-in at startup.
    builtin_names: RwLock<HashSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            builtin_names: RwLock::new(HashSet::new()),
        }
    }

    /// Add a dynamic tool. Returns `false` when the name belongs to a
    /// registered built-in or to the stop tool.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_string();
        if name == STOP_TOOL_NAME || self.builtin_names.read().await.contains(&name) {
            tracing::warn!(tool = %name, "Rejected tool registration: name is reserved");
            return false;
        }
        self.tools.write().await.insert(name.clone(), tool);
        tracing::debug!(tool = %name, "Registered tool");
        true
    }

    /// Add a built-in tool while the registry is still private to startup.
    pub fn register_builtin(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let (Ok(mut tools), Ok(mut builtins)) =
            (self.tools.try_write(), self.builtin_names.try_write())
        else {
            tracing::warn!(tool = %name, "Registry busy, built-in tool skipped");
            return;
        };
        if PROTECTED_TOOL_NAMES.contains(&name.as_str()) {
            builtins.insert(name.clone());
        }
        tools.insert(name.clone(), tool);
        tracing::debug!(tool = %name, "Registered built-in tool");
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Number of registered tools, or zero while a write is in progress.
    pub fn len(&self) -> usize {
        self.tools.try_read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Definitions offered to the model, sorted by name.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .await
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
