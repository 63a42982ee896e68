//! Per-namespace entry point: schedule work, inspect the queue and run the
//! workflow engine for claimed tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, SchedulerError};
use crate::memory::{MemorySession, MemoryStore};
use crate::scheduler::{Task, TaskEvent, TaskExecutor, TaskQueueSnapshot, TaskScheduler};
use crate::workflow::{FinishedWorkflow, RunOutcome, WorkflowEngine};

pub const DEFAULT_SEED: &str = "Start the workflow. Check what needs attention and act on it.";

const TERMINAL_RETRY_BASE: Duration = Duration::from_millis(100);

enum Terminal {
    Completed(serde_json::Value),
    Failed(String),
}

/// Runner behaviour toggles.
#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    pub self_schedule: bool,
    pub terminal_write_attempts: u32,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            self_schedule: true,
            terminal_write_attempts: 3,
        }
    }
}

pub struct OrchestratorRunner {
    namespace: String,
    scheduler: Arc<TaskScheduler>,
    memory: Arc<dyn MemoryStore>,
    engine: WorkflowEngine,
    options: RunnerOptions,
}

impl OrchestratorRunner {
    pub fn new(
        namespace: impl Into<String>,
        scheduler: Arc<TaskScheduler>,
        memory: Arc<dyn MemoryStore>,
        engine: WorkflowEngine,
        options: RunnerOptions,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            scheduler,
            memory,
            engine,
            options,
        }
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    // ── Running ─────────────────────────────────────────────────────

    /// Run a workflow now and wait for its result.
    ///
    /// The seed is recorded as a task and claimed through the same slot the
    /// execution loop uses. If another task is in flight the new task stays
    /// queued and `NamespaceBusy` is returned.
    pub async fn run_workflow(&self, seed: Option<&str>) -> Result<FinishedWorkflow, Error> {
        let seed = seed.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(DEFAULT_SEED);
        let task = self.scheduler.schedule_immediate(&self.namespace, seed).await?;

        let task = match self.scheduler.claim_task(&self.namespace, task.id).await {
            Ok(task) => task,
            Err(e @ SchedulerError::NamespaceBusy { .. }) => {
                info!(
                    namespace = %self.namespace,
                    task_id = %task.id,
                    "Namespace busy, workflow left queued"
                );
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        self.execute_task(task).await
    }

    /// Run an already claimed task and record its terminal status.
    pub async fn execute_task(&self, task: Task) -> Result<FinishedWorkflow, Error> {
        let outcome = self.run_with_memory(&task).await;

        match outcome {
            Ok(outcome) => {
                let result = serde_json::to_value(&outcome.finished)
                    .unwrap_or_else(|_| serde_json::json!({ "summary": outcome.finished.summary }));
                self.write_terminal(task.id, Terminal::Completed(result))
                    .await?;
                self.schedule_follow_up(&outcome).await;
                Ok(outcome.finished)
            }
            Err(e) => {
                warn!(namespace = %self.namespace, task_id = %task.id, error = %e, "Workflow failed");
                self.write_terminal(task.id, Terminal::Failed(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Open a memory session, run the engine, and close the session on
    /// every exit path.
    async fn run_with_memory(&self, task: &Task) -> Result<RunOutcome, Error> {
        let session: Arc<dyn MemorySession> = self.memory.open(&self.namespace).await?;
        let result = self
            .engine
            .run(&self.namespace, &task.message, Some(Arc::clone(&session)))
            .await;
        if let Err(e) = session.close().await {
            warn!(namespace = %self.namespace, error = %e, "Failed to close memory session");
        }
        Ok(result?)
    }

    async fn write_terminal(&self, id: Uuid, terminal: Terminal) -> Result<(), SchedulerError> {
        let attempts = self.options.terminal_write_attempts.max(1);
        let mut attempt = 1;
        loop {
            let written = match &terminal {
                Terminal::Completed(result) => {
                    self.scheduler
                        .complete_task(&self.namespace, id, result.clone())
                        .await
                }
                Terminal::Failed(reason) => {
                    self.scheduler
                        .fail_task(&self.namespace, id, reason.clone())
                        .await
                }
            };
            match written {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        namespace = %self.namespace,
                        task_id = %id,
                        attempt,
                        error = %e,
                        "Terminal status write failed, retrying"
                    );
                    tokio::time::sleep(TERMINAL_RETRY_BASE * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        namespace = %self.namespace,
                        task_id = %id,
                        error = %e,
                        "Giving up on terminal status write"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn schedule_follow_up(&self, outcome: &RunOutcome) {
        if !self.options.self_schedule {
            return;
        }
        let Some(prompt) = outcome.finished.next_workflow_prompt.as_deref() else {
            return;
        };
        let scheduled = match outcome.finished.seconds_until_next_workflow {
            Some(secs) => {
                self.scheduler
                    .schedule_in(&self.namespace, prompt, Duration::from_secs(secs))
                    .await
            }
            None => {
                self.scheduler
                    .schedule_immediate(&self.namespace, prompt)
                    .await
            }
        };
        match scheduled {
            Ok(task) => info!(
                namespace = %self.namespace,
                task_id = %task.id,
                scheduled_for = %task.scheduled_for,
                "Scheduled follow-up workflow"
            ),
            Err(e) => warn!(namespace = %self.namespace, error = %e, "Failed to schedule follow-up"),
        }
    }

    // ── Queue operations ────────────────────────────────────────────

    pub async fn schedule_task(
        &self,
        message: &str,
        execute_at: DateTime<Utc>,
    ) -> Result<Task, SchedulerError> {
        self.scheduler
            .schedule_task(&self.namespace, message, execute_at)
            .await
    }

    /// Schedule after `delay`, or after the short immediate delay.
    pub async fn schedule_in(
        &self,
        message: &str,
        delay: Option<Duration>,
    ) -> Result<Task, SchedulerError> {
        match delay {
            Some(delay) => self.scheduler.schedule_in(&self.namespace, message, delay).await,
            None => self.scheduler.schedule_immediate(&self.namespace, message).await,
        }
    }

    pub async fn get_task_queue(&self) -> Result<TaskQueueSnapshot, SchedulerError> {
        self.scheduler.get_task_queue(&self.namespace).await
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<(), SchedulerError> {
        self.scheduler.delete_task(&self.namespace, id).await
    }

    /// Queue changes for this namespace. Events missed by a lagging
    /// consumer are skipped.
    pub fn queue_changes(&self) -> impl Stream<Item = TaskEvent> + Send + 'static {
        let namespace = self.namespace.clone();
        self.scheduler.stream().filter_map(move |event| match event {
            Ok(event) if event.namespace() == namespace => Some(event),
            Ok(_) => None,
            Err(e) => {
                debug!(namespace = %namespace, error = %e, "Queue change stream lagged");
                None
            }
        })
    }
}

#[async_trait]
impl TaskExecutor for OrchestratorRunner {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn execute_next(&self) -> Result<Option<Uuid>, Error> {
        let Some(task) = self.scheduler.claim_next(&self.namespace).await? else {
            return Ok(None);
        };
        let id = task.id;
        match self.execute_task(task).await {
            Ok(_) => Ok(Some(id)),
            // The failure is already recorded on the task.
            Err(Error::Workflow(_)) | Err(Error::Memory(_)) | Err(Error::Llm(_)) => Ok(Some(id)),
            Err(e) => Err(e),
        }
    }
}
