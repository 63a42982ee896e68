//! Per-namespace polling loops.
//!
//! The scheduler tick only looks for due work and nudges the execution tick.
//! The execution tick claims and runs one task at a time; while a run is in
//! progress that namespace's execution loop is blocked on it. The two loops
//! share nothing except the scheduler's atomic claim.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::scheduler::queue::TaskScheduler;

/// Something that can claim and run the next due task of one namespace.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn namespace(&self) -> &str;

    /// Claim and run the next due task. Returns the id of the task that ran.
    async fn execute_next(&self) -> Result<Option<Uuid>, Error>;
}

/// Handles for one namespace's loops.
pub struct NamespaceLoops {
    pub namespace: String,
    pub scheduler: JoinHandle<()>,
    pub execution: JoinHandle<()>,
}

impl NamespaceLoops {
    /// Wait for both loops to exit.
    pub async fn join(self) {
        if let Err(e) = self.scheduler.await {
            error!(namespace = %self.namespace, error = %e, "Scheduler tick panicked");
        }
        if let Err(e) = self.execution.await {
            error!(namespace = %self.namespace, error = %e, "Execution tick panicked");
        }
    }
}

/// Spawn both loops for a namespace. They exit once `shutdown` flips to
/// `true` (or its sender is dropped).
pub fn spawn_namespace_loops(
    scheduler: Arc<TaskScheduler>,
    executor: Arc<dyn TaskExecutor>,
    scheduler_tick: Duration,
    execution_tick: Duration,
    shutdown: watch::Receiver<bool>,
) -> NamespaceLoops {
    let wake = Arc::new(Notify::new());
    let namespace = executor.namespace().to_string();

    NamespaceLoops {
        scheduler: spawn_scheduler_tick(
            scheduler,
            namespace.clone(),
            scheduler_tick,
            Arc::clone(&wake),
            shutdown.clone(),
        ),
        execution: spawn_execution_tick(executor, execution_tick, wake, shutdown),
        namespace,
    }
}

/// Spawn the loop that watches for due tasks.
pub fn spawn_scheduler_tick(
    scheduler: Arc<TaskScheduler>,
    namespace: String,
    interval: Duration,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(namespace = %namespace, interval_ms = interval.as_millis() as u64, "Scheduler tick started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if scheduler.is_processing(&namespace).await {
                continue;
            }
            match scheduler.has_due(&namespace, Utc::now()).await {
                Ok(true) => {
                    debug!(namespace = %namespace, "Due task found");
                    wake.notify_one();
                }
                Ok(false) => {}
                // Retried on the next tick.
                Err(e) => warn!(namespace = %namespace, error = %e, "Scheduler tick failed"),
            }
        }

        info!(namespace = %namespace, "Scheduler tick stopped");
    })
}

/// Spawn the loop that claims and runs tasks.
pub fn spawn_execution_tick(
    executor: Arc<dyn TaskExecutor>,
    interval: Duration,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let namespace = executor.namespace().to_string();
        info!(namespace = %namespace, interval_ms = interval.as_millis() as u64, "Execution tick started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match executor.execute_next().await {
                Ok(Some(id)) => debug!(namespace = %namespace, task_id = %id, "Task run finished"),
                Ok(None) => {}
                Err(e) => error!(namespace = %namespace, error = %e, "Execution tick failed"),
            }
        }

        info!(namespace = %namespace, "Execution tick stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::scheduler::TaskStatus;
    use crate::store::{LibSqlTaskStore, TaskStore};

    /// Claims through the scheduler and completes immediately.
    struct RecordingExecutor {
        scheduler: Arc<TaskScheduler>,
        ran: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        fn namespace(&self) -> &str {
            "ns"
        }

        async fn execute_next(&self) -> Result<Option<Uuid>, Error> {
            let Some(task) = self.scheduler.claim_next("ns").await? else {
                return Ok(None);
            };
            self.ran.lock().unwrap().push(task.message.clone());
            self.scheduler
                .complete_task("ns", task.id, serde_json::json!("ok"))
                .await?;
            Ok(Some(task.id))
        }
    }

    #[tokio::test]
    async fn loops_drain_due_tasks_and_stop_on_shutdown() {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlTaskStore::new_memory().await.unwrap());
        let scheduler = Arc::new(TaskScheduler::new(Arc::clone(&store), Duration::ZERO));
        scheduler.schedule_task("ns", "one", Utc::now()).await.unwrap();
        scheduler.schedule_task("ns", "two", Utc::now()).await.unwrap();

        let executor = Arc::new(RecordingExecutor {
            scheduler: Arc::clone(&scheduler),
            ran: Mutex::new(Vec::new()),
        });
        let (tx, rx) = watch::channel(false);
        let loops = spawn_namespace_loops(
            Arc::clone(&scheduler),
            executor.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
            rx,
        );

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = store
                    .list_by_status("ns", &[TaskStatus::Completed], None, None)
                    .await
                    .unwrap();
                if done.len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "tasks were not drained in time");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), loops.join())
            .await
            .expect("loops did not stop");

        assert_eq!(*executor.ran.lock().unwrap(), vec!["one", "two"]);
    }
}
