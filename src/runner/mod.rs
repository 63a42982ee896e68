//! Runner facade and the per-namespace registry that owns runners.

pub mod facade;
pub mod registry;

pub use facade::{DEFAULT_SEED, OrchestratorRunner, RunnerOptions};
pub use registry::RunnerRegistry;
