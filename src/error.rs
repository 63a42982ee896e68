//! Error types for the orchestrator.

use std::time::Duration;

use uuid::Uuid;

use crate::scheduler::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Storage errors. These propagate unmodified; the store never retries.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that abort a workflow run.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("EngineRecursionExceeded: run visited the input node {limit} times without stopping")]
    RecursionExceeded { limit: u32 },

    #[error("Decision step failed: {0}")]
    Decision(LlmError),

    #[error("Finish step failed: {0}")]
    Finish(LlmError),

    #[error("Summarization failed: {0}")]
    Summary(LlmError),
}

/// Task scheduling errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task {id} not found in namespace {namespace}")]
    TaskNotFound { namespace: String, id: Uuid },

    #[error("Task {id} cannot be cancelled while {status}")]
    NotCancellable { id: Uuid, status: TaskStatus },

    #[error("Task {id} cannot be claimed while {status}")]
    NotClaimable { id: Uuid, status: TaskStatus },

    #[error("Namespace {namespace} already has a task in flight")]
    NamespaceBusy { namespace: String },

    #[error("Delay of {seconds}s exceeds the {max_seconds}s scheduling horizon")]
    DelayOutOfRange { seconds: u64, max_seconds: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Memory store errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Memory session for {namespace} is closed")]
    Closed { namespace: String },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
