//! `TaskStore` trait: async interface for task persistence.
//!
//! Every method is scoped to a namespace. Implementations keep each
//! namespace in its own partition, created on first access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::scheduler::{StatusUpdate, Task, TaskStatus};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new `scheduled` task.
    async fn create_task(
        &self,
        namespace: &str,
        message: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Task, DatabaseError>;

    /// Move a task forward in its lifecycle. Returns the number of rows
    /// changed: zero when the id is unknown or the write would move the
    /// status backwards.
    async fn update_status(
        &self,
        namespace: &str,
        id: Uuid,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<u64, DatabaseError>;

    /// Compare-and-swap: apply the change only while the task is in `from`.
    async fn transition(
        &self,
        namespace: &str,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        update: StatusUpdate,
    ) -> Result<u64, DatabaseError>;

    async fn get_by_id(&self, namespace: &str, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Tasks in any of `statuses`, ordered by `scheduled_for` then insertion.
    async fn list_by_status(
        &self,
        namespace: &str,
        statuses: &[TaskStatus],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Scheduled tasks whose `scheduled_for <= now`, earliest first.
    async fn get_due_at(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Scheduled tasks due at the current wall-clock time.
    async fn get_next_due(&self, namespace: &str, limit: usize) -> Result<Vec<Task>, DatabaseError> {
        self.get_due_at(namespace, Utc::now(), limit).await
    }

    /// Remove a task that is still `scheduled`. Returns rows deleted.
    async fn delete_task(&self, namespace: &str, id: Uuid) -> Result<u64, DatabaseError>;

    /// Terminal tasks, most recently finished first.
    async fn list_recent_finished(
        &self,
        namespace: &str,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;
}
