//! Built-in tools: scheduler self-service, thinking, and memory.

pub mod memory;
pub mod scheduler;
pub mod thinking;

pub use memory::{MemoryInsertTool, MemorySearchTool};
pub use scheduler::{
    SchedulerAddTaskTool, SchedulerDeleteTaskTool, SchedulerGetCompletedTasksTool,
    SchedulerGetScheduledTasksTool, scheduler_tools,
};
pub use thinking::ThinkingTool;

use std::sync::Arc;

use crate::scheduler::TaskScheduler;
use crate::tools::ToolRegistry;

/// Register every built-in tool.
pub fn register_builtin_tools(registry: &ToolRegistry, scheduler: &Arc<TaskScheduler>) {
    for tool in scheduler_tools(scheduler) {
        registry.register_builtin(tool);
    }
    registry.register_builtin(Arc::new(ThinkingTool));
    registry.register_builtin(Arc::new(MemorySearchTool));
    registry.register_builtin(Arc::new(MemoryInsertTool));
}
