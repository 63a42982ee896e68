//! libSQL-backed memory store sharing the task database connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, params};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DatabaseError, MemoryError};
use crate::memory::{MemoryEntry, MemorySession, MemoryStore};
use crate::store::migrations::namespaced_table;

pub struct LibSqlMemoryStore {
    conn: Connection,
    initialized: Mutex<HashSet<String>>,
}

impl LibSqlMemoryStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            initialized: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_table(&self, table: &str) -> Result<(), DatabaseError> {
        let mut initialized = self.initialized.lock().await;
        if initialized.contains(table) {
            return Ok(());
        }
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );"
            ))
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to create {table}: {e}")))?;
        initialized.insert(table.to_string());
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for LibSqlMemoryStore {
    async fn open(&self, namespace: &str) -> Result<Arc<dyn MemorySession>, MemoryError> {
        let table = namespaced_table("memory", namespace);
        self.ensure_table(&table).await?;
        debug!(namespace, "Memory session opened");
        Ok(Arc::new(LibSqlMemorySession {
            namespace: namespace.to_string(),
            table,
            conn: self.conn.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LibSqlMemorySession {
    namespace: String,
    table: String,
    conn: Connection,
    closed: AtomicBool,
}

impl LibSqlMemorySession {
    fn check_open(&self) -> Result<(), MemoryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MemoryError::Closed {
                namespace: self.namespace.clone(),
            });
        }
        Ok(())
    }
}

/// Escape LIKE wildcards so the query matches literally.
fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[async_trait]
impl MemorySession for LibSqlMemorySession {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError> {
        self.check_open()?;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT id, content, created_at FROM {} WHERE content LIKE ?1 ESCAPE '\\'
                     ORDER BY created_at DESC LIMIT ?2",
                    self.table
                ),
                params![like_pattern(query), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("memory search: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("memory search: {e}")))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            let created: String = row
                .get(2)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            entries.push(MemoryEntry {
                id: Uuid::parse_str(&id).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                content: row
                    .get(1)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
                created_at: DateTime::parse_from_rfc3339(&created)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            });
        }
        Ok(entries)
    }

    async fn insert(&self, content: &str) -> Result<MemoryEntry, MemoryError> {
        self.check_open()?;
        let entry = MemoryEntry {
            id: Uuid::new_v4(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {} (id, content, created_at) VALUES (?1, ?2, ?3)",
                    self.table
                ),
                params![
                    entry.id.to_string(),
                    entry.content.clone(),
                    entry.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("memory insert: {e}")))?;
        Ok(entry)
    }

    async fn close(&self) -> Result<(), MemoryError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(namespace = %self.namespace, "Memory session closed");
        }
        Ok(())
    }
}
