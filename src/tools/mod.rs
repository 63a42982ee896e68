//! Tool abstraction, registry and dispatcher.

pub mod builtin;
pub mod dispatcher;
pub mod registry;
pub mod tool;

pub use dispatcher::{ToolCallResult, ToolDispatcher, ToolErrorCode, ToolOutcome};
pub use registry::ToolRegistry;
pub use tool::*;
