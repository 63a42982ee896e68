//! Task scheduler: turns due tasks into exactly one executing task per
//! namespace.
//!
//! Every namespace owns a slot guarded by an async mutex. Claiming, finishing
//! and recovering all happen under that lock, and the persisted status is
//! checked again inside it, so two callers can never both observe a free
//! namespace and start work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::scheduler::task::{StatusUpdate, Task, TaskStatus};
use crate::store::TaskStore;

/// Most scheduled tasks reported by a queue snapshot.
pub const MAX_SCHEDULED_TASKS: usize = 100;
/// Most finished tasks reported by a queue snapshot.
pub const MAX_COMPLETED_TASKS: usize = 50;

/// Furthest ahead a relative delay may schedule a task (one year).
pub const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(366 * 24 * 60 * 60);

const EVENT_CAPACITY: usize = 256;

/// Queue change notification.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Scheduled { task: Task },
    Started { task: Task },
    Finished { task: Task },
    Deleted { namespace: String, id: Uuid },
}

impl TaskEvent {
    pub fn namespace(&self) -> &str {
        match self {
            Self::Scheduled { task } | Self::Started { task } | Self::Finished { task } => {
                &task.namespace
            }
            Self::Deleted { namespace, .. } => namespace,
        }
    }
}

/// Read-only view of a namespace's queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueueSnapshot {
    pub current: Option<Task>,
    pub scheduled: Vec<Task>,
    pub completed: Vec<Task>,
}

/// A terminal write the store rejected. The task row is still `processing`
/// and is settled on the next claim.
struct PendingFinish {
    id: Uuid,
    status: TaskStatus,
    update: StatusUpdate,
}

#[derive(Default)]
struct NamespaceSlot {
    current: Option<Task>,
    pending: Option<PendingFinish>,
}

pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    slots: RwLock<HashMap<String, Arc<Mutex<NamespaceSlot>>>>,
    events: broadcast::Sender<TaskEvent>,
    immediate_delay: Duration,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn TaskStore>, immediate_delay: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            slots: RwLock::new(HashMap::new()),
            events,
            immediate_delay,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    async fn slot(&self, namespace: &str) -> Arc<Mutex<NamespaceSlot>> {
        if let Some(slot) = self.slots.read().await.get(namespace) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(namespace.to_string()).or_default())
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ── Claiming ────────────────────────────────────────────────────

    /// Claim the earliest due task if nothing is running in the namespace.
    pub async fn claim_next(&self, namespace: &str) -> Result<Option<Task>, SchedulerError> {
        self.claim_next_at(namespace, Utc::now()).await
    }

    /// `claim_next` evaluated against an explicit clock.
    pub async fn claim_next_at(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, SchedulerError> {
        let slot = self.slot(namespace).await;
        let mut slot = slot.lock().await;

        if let Some(current) = &slot.current {
            debug!(namespace, task_id = %current.id, "Namespace busy, nothing claimed");
            return Ok(None);
        }
        self.settle_pending(namespace, &mut slot).await?;
        if self.has_processing_row(namespace).await? {
            return Ok(None);
        }

        let Some(task) = self.store.get_due_at(namespace, now, 1).await?.into_iter().next()
        else {
            return Ok(None);
        };

        let claimed = self.mark_processing(namespace, task).await?;
        if let Some(task) = &claimed {
            slot.current = Some(task.clone());
            info!(namespace, task_id = %task.id, "Claimed task");
            self.emit(TaskEvent::Started { task: task.clone() });
        }
        Ok(claimed)
    }

    /// Claim one specific scheduled task, regardless of its due time.
    ///
    /// Used by interactive runs, which go through the same slot as the
    /// execution loop.
    pub async fn claim_task(&self, namespace: &str, id: Uuid) -> Result<Task, SchedulerError> {
        let slot = self.slot(namespace).await;
        let mut slot = slot.lock().await;

        if slot.current.is_none() {
            self.settle_pending(namespace, &mut slot).await?;
        }
        if slot.current.is_some() || self.has_processing_row(namespace).await? {
            return Err(SchedulerError::NamespaceBusy {
                namespace: namespace.to_string(),
            });
        }

        let task = self
            .store
            .get_by_id(namespace, id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                namespace: namespace.to_string(),
                id,
            })?;
        let status = task.status;

        match self.mark_processing(namespace, task).await? {
            Some(task) => {
                slot.current = Some(task.clone());
                info!(namespace, task_id = %task.id, "Claimed task directly");
                self.emit(TaskEvent::Started { task: task.clone() });
                Ok(task)
            }
            None => Err(SchedulerError::NotClaimable { id, status }),
        }
    }

    async fn has_processing_row(&self, namespace: &str) -> Result<bool, SchedulerError> {
        let rows = self
            .store
            .list_by_status(namespace, &[TaskStatus::Processing], Some(1), None)
            .await?;
        if let Some(orphan) = rows.first() {
            warn!(
                namespace,
                task_id = %orphan.id,
                "Store reports a processing task this scheduler does not own"
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn mark_processing(
        &self,
        namespace: &str,
        mut task: Task,
    ) -> Result<Option<Task>, SchedulerError> {
        let started = Utc::now();
        let changed = self
            .store
            .transition(
                namespace,
                task.id,
                TaskStatus::Scheduled,
                TaskStatus::Processing,
                StatusUpdate::started(started),
            )
            .await?;
        if changed == 0 {
            debug!(namespace, task_id = %task.id, "Task changed before it could be claimed");
            return Ok(None);
        }
        task.status = TaskStatus::Processing;
        task.started_at = Some(started);
        Ok(Some(task))
    }

    // ── Finishing ───────────────────────────────────────────────────

    pub async fn complete_task(
        &self,
        namespace: &str,
        id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), SchedulerError> {
        self.finish(namespace, id, TaskStatus::Completed, StatusUpdate::completed(result))
            .await
    }

    pub async fn fail_task(
        &self,
        namespace: &str,
        id: Uuid,
        error: impl Into<String>,
    ) -> Result<(), SchedulerError> {
        self.finish(namespace, id, TaskStatus::Failed, StatusUpdate::failed(error))
            .await
    }

    pub async fn stop_task(
        &self,
        namespace: &str,
        id: Uuid,
        reason: impl Into<String>,
    ) -> Result<(), SchedulerError> {
        self.finish(namespace, id, TaskStatus::Stopped, StatusUpdate::failed(reason))
            .await
    }

    /// Write a terminal status and release the namespace.
    ///
    /// The slot is released even when the write fails. The rejected write
    /// is kept and retried before the next claim, so the namespace never
    /// stays held by a run that already ended.
    async fn finish(
        &self,
        namespace: &str,
        id: Uuid,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<(), SchedulerError> {
        let slot = self.slot(namespace).await;
        let mut slot = slot.lock().await;

        let written = self
            .store
            .transition(namespace, id, TaskStatus::Processing, status, update.clone())
            .await;
        if slot.current.as_ref().is_some_and(|t| t.id == id) {
            slot.current = None;
        }
        let changed = match written {
            Ok(changed) => {
                if slot.pending.as_ref().is_some_and(|p| p.id == id) {
                    slot.pending = None;
                }
                changed
            }
            Err(e) => {
                slot.pending = Some(PendingFinish { id, status, update });
                return Err(e.into());
            }
        };
        drop(slot);

        if changed == 0 {
            warn!(namespace, task_id = %id, %status, "Terminal status write changed no rows");
        }
        self.announce_finished(namespace, id, status).await
    }

    /// Retry a terminal write the store rejected earlier.
    async fn settle_pending(
        &self,
        namespace: &str,
        slot: &mut NamespaceSlot,
    ) -> Result<(), SchedulerError> {
        let Some(pending) = &slot.pending else {
            return Ok(());
        };
        let (id, status) = (pending.id, pending.status);
        self.store
            .transition(
                namespace,
                id,
                TaskStatus::Processing,
                status,
                pending.update.clone(),
            )
            .await?;
        slot.pending = None;
        info!(namespace, task_id = %id, %status, "Settled deferred terminal status");
        self.announce_finished(namespace, id, status).await
    }

    async fn announce_finished(
        &self,
        namespace: &str,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<(), SchedulerError> {
        if let Some(task) = self.store.get_by_id(namespace, id).await? {
            info!(namespace, task_id = %id, %status, "Task finished");
            self.emit(TaskEvent::Finished { task });
        }
        Ok(())
    }

    // ── Scheduling ──────────────────────────────────────────────────

    pub async fn schedule_task(
        &self,
        namespace: &str,
        message: &str,
        execute_at: DateTime<Utc>,
    ) -> Result<Task, SchedulerError> {
        let task = self
            .store
            .create_task(namespace, message, execute_at)
            .await?;
        info!(
            namespace,
            task_id = %task.id,
            scheduled_for = %task.scheduled_for,
            "Scheduled task"
        );
        self.emit(TaskEvent::Scheduled { task: task.clone() });
        Ok(task)
    }

    /// Schedule `delay` from now. Delays past [`MAX_SCHEDULE_DELAY`] are
    /// rejected.
    pub async fn schedule_in(
        &self,
        namespace: &str,
        message: &str,
        delay: Duration,
    ) -> Result<Task, SchedulerError> {
        let execute_at = due_after(Utc::now(), delay)?;
        self.schedule_task(namespace, message, execute_at).await
    }

    /// Schedule after the short fixed delay, so a task submitted while
    /// another is running does not race it.
    pub async fn schedule_immediate(
        &self,
        namespace: &str,
        message: &str,
    ) -> Result<Task, SchedulerError> {
        self.schedule_in(namespace, message, self.immediate_delay)
            .await
    }

    /// Cancel a task that has not started yet.
    pub async fn delete_task(&self, namespace: &str, id: Uuid) -> Result<(), SchedulerError> {
        if self.store.delete_task(namespace, id).await? > 0 {
            info!(namespace, task_id = %id, "Deleted scheduled task");
            self.emit(TaskEvent::Deleted {
                namespace: namespace.to_string(),
                id,
            });
            return Ok(());
        }

        match self.store.get_by_id(namespace, id).await? {
            Some(task) => Err(SchedulerError::NotCancellable {
                id,
                status: task.status,
            }),
            None => Err(SchedulerError::TaskNotFound {
                namespace: namespace.to_string(),
                id,
            }),
        }
    }

    // ── Observation ─────────────────────────────────────────────────

    pub async fn get_task_queue(&self, namespace: &str) -> Result<TaskQueueSnapshot, SchedulerError> {
        let current = self
            .store
            .list_by_status(namespace, &[TaskStatus::Processing], Some(1), None)
            .await?
            .into_iter()
            .next();
        let scheduled = self
            .store
            .list_by_status(
                namespace,
                &[TaskStatus::Scheduled],
                Some(MAX_SCHEDULED_TASKS),
                None,
            )
            .await?;
        let completed = self
            .store
            .list_recent_finished(namespace, MAX_COMPLETED_TASKS)
            .await?;

        Ok(TaskQueueSnapshot {
            current,
            scheduled,
            completed,
        })
    }

    /// Whether this scheduler currently holds the namespace.
    pub async fn is_processing(&self, namespace: &str) -> bool {
        self.slot(namespace).await.lock().await.current.is_some()
    }

    /// Whether any task is due at `now`.
    pub async fn has_due(&self, namespace: &str, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        Ok(!self.store.get_due_at(namespace, now, 1).await?.is_empty())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<TaskEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    // ── Recovery ────────────────────────────────────────────────────

    /// Mark tasks left `processing` by a previous process as stopped and
    /// schedule a fresh copy of each so the work is retried.
    pub async fn recover_stale(&self, namespace: &str) -> Result<usize, SchedulerError> {
        let slot = self.slot(namespace).await;
        let slot = slot.lock().await;

        let stale = self
            .store
            .list_by_status(namespace, &[TaskStatus::Processing], None, None)
            .await?;

        let mut recovered = 0;
        for task in stale {
            if slot.current.as_ref().is_some_and(|c| c.id == task.id)
                || slot.pending.as_ref().is_some_and(|p| p.id == task.id)
            {
                continue;
            }
            let changed = self
                .store
                .transition(
                    namespace,
                    task.id,
                    TaskStatus::Processing,
                    TaskStatus::Stopped,
                    StatusUpdate::failed("Interrupted by restart"),
                )
                .await?;
            if changed == 0 {
                continue;
            }
            let retry = self
                .store
                .create_task(namespace, &task.message, Utc::now())
                .await?;
            info!(
                namespace,
                stale_id = %task.id,
                retry_id = %retry.id,
                "Recovered interrupted task"
            );
            self.emit(TaskEvent::Scheduled { task: retry });
            recovered += 1;
        }
        Ok(recovered)
    }
}

fn due_after(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, SchedulerError> {
    let out_of_range = || SchedulerError::DelayOutOfRange {
        seconds: delay.as_secs(),
        max_seconds: MAX_SCHEDULE_DELAY.as_secs(),
    };
    if delay > MAX_SCHEDULE_DELAY {
        return Err(out_of_range());
    }
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(out_of_range)
}
