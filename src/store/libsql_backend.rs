//! libSQL backend: async `TaskStore` implementation.
//!
//! A single long-lived connection is shared by every namespace. Each
//! namespace gets its own table, created the first time it is touched, and
//! its own write lock so writes are serialized per partition while reads
//! run freely.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::scheduler::{StatusUpdate, Task, TaskStatus};
use crate::store::migrations;
use crate::store::traits::TaskStore;

const TASK_COLUMNS: &str =
    "id, message, status, created_at, scheduled_for, started_at, completed_at, result, error";

/// One namespace's storage partition.
struct Partition {
    table: String,
    write_lock: Mutex<()>,
}

/// libSQL task store.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    partitions: RwLock<HashMap<String, Arc<Partition>>>,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            partitions: RwLock::new(HashMap::new()),
        })
    }

    /// The shared connection, for collaborators that keep their own tables
    /// in the same database.
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    /// Look up (or lazily create) the partition for a namespace.
    async fn partition(&self, namespace: &str) -> Result<Arc<Partition>, DatabaseError> {
        if let Some(p) = self.partitions.read().await.get(namespace) {
            return Ok(Arc::clone(p));
        }

        let mut partitions = self.partitions.write().await;
        if let Some(p) = partitions.get(namespace) {
            return Ok(Arc::clone(p));
        }

        let table = migrations::partition_table_name(namespace);
        migrations::ensure_partition(&self.conn, namespace, &table).await?;
        debug!(namespace, table = %table, "Task partition ready");

        let partition = Arc::new(Partition {
            table,
            write_lock: Mutex::new(()),
        });
        partitions.insert(namespace.to_string(), Arc::clone(&partition));
        Ok(partition)
    }

    async fn query_tasks(
        &self,
        namespace: &str,
        sql: &str,
        values: Vec<Value>,
        op: &str,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => tasks.push(row_to_task(&row, namespace)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that text order matches time order.
fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_ts).transpose()
}

fn opt_text(s: Option<String>) -> Value {
    match s {
        Some(s) => Value::Text(s),
        None => Value::Null,
    }
}

fn status_placeholders(statuses: &[TaskStatus], first: usize) -> String {
    (0..statuses.len())
        .map(|i| format!("?{}", first + i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_task(row: &libsql::Row, namespace: &str) -> Result<Task, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Serialization(format!("task row: {e}"));

    let id_str: String = row.get(0).map_err(parse)?;
    let status_str: String = row.get(2).map_err(parse)?;
    let created_str: String = row.get(3).map_err(parse)?;
    let scheduled_str: String = row.get(4).map_err(parse)?;
    let result_str: Option<String> = row.get::<String>(7).ok();

    let result = result_str
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("task result: {e}")))?;

    Ok(Task {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("task id: {e}")))?,
        namespace: namespace.to_string(),
        message: row.get(1).map_err(parse)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        created_at: parse_ts(&created_str)?,
        scheduled_for: parse_ts(&scheduled_str)?,
        started_at: parse_optional_ts(row.get::<String>(5).ok())?,
        completed_at: parse_optional_ts(row.get::<String>(6).ok())?,
        result,
        error: row.get::<String>(8).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn create_task(
        &self,
        namespace: &str,
        message: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Task, DatabaseError> {
        let partition = self.partition(namespace).await?;
        let task = Task::new(namespace, message, scheduled_for);

        let _guard = partition.write_lock.lock().await;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {} (id, message, status, created_at, scheduled_for)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    partition.table
                ),
                params![
                    task.id.to_string(),
                    task.message.clone(),
                    task.status.as_str(),
                    format_ts(task.created_at),
                    format_ts(task.scheduled_for)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        Ok(task)
    }

    async fn update_status(
        &self,
        namespace: &str,
        id: Uuid,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<u64, DatabaseError> {
        let earlier = status.earlier_statuses();
        if earlier.is_empty() {
            return Ok(0);
        }
        self.write_status(namespace, id, &earlier, status, update, "update_status")
            .await
    }

    async fn transition(
        &self,
        namespace: &str,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        update: StatusUpdate,
    ) -> Result<u64, DatabaseError> {
        if !from.can_transition_to(to) {
            return Ok(0);
        }
        self.write_status(namespace, id, &[from], to, update, "transition")
            .await
    }

    async fn get_by_id(&self, namespace: &str, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let partition = self.partition(namespace).await?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM {} WHERE id = ?1",
            partition.table
        );
        let mut tasks = self
            .query_tasks(namespace, &sql, vec![Value::Text(id.to_string())], "get_by_id")
            .await?;
        Ok(tasks.pop())
    }

    async fn list_by_status(
        &self,
        namespace: &str,
        statuses: &[TaskStatus],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Task>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let partition = self.partition(namespace).await?;
        let n = statuses.len();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM {} WHERE status IN ({})
             ORDER BY scheduled_for ASC, rowid ASC LIMIT ?{} OFFSET ?{}",
            partition.table,
            status_placeholders(statuses, 1),
            n + 1,
            n + 2
        );

        let mut values: Vec<Value> = statuses
            .iter()
            .map(|s| Value::Text(s.as_str().to_string()))
            .collect();
        values.push(Value::Integer(limit.map(|l| l as i64).unwrap_or(-1)));
        values.push(Value::Integer(offset.unwrap_or(0) as i64));

        self.query_tasks(namespace, &sql, values, "list_by_status")
            .await
    }

    async fn get_due_at(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let partition = self.partition(namespace).await?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM {} WHERE status = 'scheduled' AND scheduled_for <= ?1
             ORDER BY scheduled_for ASC, rowid ASC LIMIT ?2",
            partition.table
        );
        self.query_tasks(
            namespace,
            &sql,
            vec![Value::Text(format_ts(now)), Value::Integer(limit as i64)],
            "get_due_at",
        )
        .await
    }

    async fn delete_task(&self, namespace: &str, id: Uuid) -> Result<u64, DatabaseError> {
        let partition = self.partition(namespace).await?;
        let _guard = partition.write_lock.lock().await;
        self.conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE id = ?1 AND status = 'scheduled'",
                    partition.table
                ),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))
    }

    async fn list_recent_finished(
        &self,
        namespace: &str,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let partition = self.partition(namespace).await?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM {} WHERE status IN ('completed', 'failed', 'stopped')
             ORDER BY completed_at DESC, rowid DESC LIMIT ?1",
            partition.table
        );
        self.query_tasks(
            namespace,
            &sql,
            vec![Value::Integer(limit as i64)],
            "list_recent_finished",
        )
        .await
    }
}

impl LibSqlTaskStore {
    async fn write_status(
        &self,
        namespace: &str,
        id: Uuid,
        allowed_from: &[TaskStatus],
        status: TaskStatus,
        update: StatusUpdate,
        op: &str,
    ) -> Result<u64, DatabaseError> {
        let partition = self.partition(namespace).await?;

        let result = update
            .result
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("{op} result: {e}")))?;

        let sql = format!(
            "UPDATE {} SET status = ?1,
                 started_at = COALESCE(?2, started_at),
                 completed_at = COALESCE(?3, completed_at),
                 result = COALESCE(?4, result),
                 error = COALESCE(?5, error)
             WHERE id = ?6 AND status IN ({})",
            partition.table,
            status_placeholders(allowed_from, 7)
        );

        let mut values = vec![
            Value::Text(status.as_str().to_string()),
            opt_text(update.started_at.map(format_ts)),
            opt_text(update.completed_at.map(format_ts)),
            opt_text(result),
            opt_text(update.error),
            Value::Text(id.to_string()),
        ];
        values.extend(
            allowed_from
                .iter()
                .map(|s| Value::Text(s.as_str().to_string())),
        );

        let _guard = partition.write_lock.lock().await;
        self.conn
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))
    }
}
