//! Memory store collaborator.
//!
//! A run opens one session for its namespace when it starts and closes it
//! when it ends. Sessions are never shared between concurrent runs.

mod libsql_memory;

pub use libsql_memory::LibSqlMemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::MemoryError;

/// A stored memory.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Factory for per-run memory sessions.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn open(&self, namespace: &str) -> Result<Arc<dyn MemorySession>, MemoryError>;
}

/// A handle onto one namespace's memories.
#[async_trait]
pub trait MemorySession: Send + Sync {
    fn namespace(&self) -> &str;

    /// Most recent memories matching `query`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError>;

    async fn insert(&self, content: &str) -> Result<MemoryEntry, MemoryError>;

    /// Release the session. Further calls fail with `MemoryError::Closed`.
    async fn close(&self) -> Result<(), MemoryError>;
}
