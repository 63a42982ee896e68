//! Scheduler self-service tools. The agent uses these to plan follow-up
//! work in its own namespace.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::scheduler::{MAX_SCHEDULE_DELAY, Task, TaskScheduler};
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

const DEFAULT_LIST_LIMIT: usize = 10;

fn task_summary(task: &Task) -> serde_json::Value {
    serde_json::json!({
        "id": task.id,
        "message": task.message,
        "status": task.status,
        "scheduledFor": task.scheduled_for,
        "completedAt": task.completed_at,
        "result": task.result,
        "error": task.error,
    })
}

fn list_limit(params: &serde_json::Value) -> usize {
    params
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|l| l as usize)
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, 50)
}

// ── scheduler_add_task ──────────────────────────────────────────────

pub struct SchedulerAddTaskTool {
    scheduler: Arc<TaskScheduler>,
}

impl SchedulerAddTaskTool {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for SchedulerAddTaskTool {
    fn name(&self) -> &str {
        "scheduler_add_task"
    }

    fn description(&self) -> &str {
        "Add a task to your own schedule for something that must happen later. \
         You will execute the task yourself, so describe it with all the context \
         you will need. Check the existing schedule first and avoid duplicates."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Detailed instruction for the future run"
                },
                "scheduleOffsetSeconds": {
                    "type": "integer",
                    "description": "Seconds from now (300 = 5 minutes). Omit to run after current work.",
                    "minimum": 0
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let message = require_str(&params, "message")?;
        if message.trim().is_empty() {
            return Err(ToolError::InvalidParameters("message cannot be empty".into()));
        }

        let offset = match params.get("scheduleOffsetSeconds") {
            None | Some(serde_json::Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(secs) if secs <= MAX_SCHEDULE_DELAY.as_secs() => Some(secs),
                _ => {
                    return Err(ToolError::InvalidParameters(format!(
                        "scheduleOffsetSeconds must be an integer between 0 and {}",
                        MAX_SCHEDULE_DELAY.as_secs()
                    )));
                }
            },
        };

        let task = match offset {
            Some(secs) => {
                self.scheduler
                    .schedule_in(&ctx.namespace, message, Duration::from_secs(secs))
                    .await
            }
            None => {
                self.scheduler
                    .schedule_immediate(&ctx.namespace, message)
                    .await
            }
        }
        .map_err(|e| ToolError::ExecutionFailed(format!("Failed to schedule task: {e}")))?;

        Ok(ToolOutput::success(
            serde_json::json!({
                "taskId": task.id,
                "scheduledFor": task.scheduled_for,
            }),
            start.elapsed(),
        ))
    }
}

// ── scheduler_delete_task ───────────────────────────────────────────

pub struct SchedulerDeleteTaskTool {
    scheduler: Arc<TaskScheduler>,
}

impl SchedulerDeleteTaskTool {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for SchedulerDeleteTaskTool {
    fn name(&self) -> &str {
        "scheduler_delete_task"
    }

    fn description(&self) -> &str {
        "Delete a scheduled task that is no longer needed or is scheduled at the wrong time. \
         Tasks that already started cannot be deleted."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "taskId": { "type": "string", "description": "ID of the task to delete" }
            },
            "required": ["taskId"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let raw = require_str(&params, "taskId")?;
        let id = Uuid::parse_str(raw)
            .map_err(|e| ToolError::InvalidParameters(format!("taskId is not a UUID: {e}")))?;

        self.scheduler
            .delete_task(&ctx.namespace, id)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        Ok(ToolOutput::text(
            format!("Task {id} deleted"),
            start.elapsed(),
        ))
    }
}

// ── scheduler_get_scheduled_tasks ───────────────────────────────────

pub struct SchedulerGetScheduledTasksTool {
    scheduler: Arc<TaskScheduler>,
}

impl SchedulerGetScheduledTasksTool {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for SchedulerGetScheduledTasksTool {
    fn name(&self) -> &str {
        "scheduler_get_scheduled_tasks"
    }

    fn description(&self) -> &str {
        "List upcoming tasks on your schedule, soonest first."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Max tasks (default 10, max 50)" }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let queue = self
            .scheduler
            .get_task_queue(&ctx.namespace)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let tasks: Vec<serde_json::Value> = queue
            .scheduled
            .iter()
            .take(list_limit(&params))
            .map(task_summary)
            .collect();
        Ok(ToolOutput::success(
            serde_json::json!({ "tasks": tasks }),
            start.elapsed(),
        ))
    }
}

// ── scheduler_get_completed_tasks ───────────────────────────────────

pub struct SchedulerGetCompletedTasksTool {
    scheduler: Arc<TaskScheduler>,
}

impl SchedulerGetCompletedTasksTool {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Tool for SchedulerGetCompletedTasksTool {
    fn name(&self) -> &str {
        "scheduler_get_completed_tasks"
    }

    fn description(&self) -> &str {
        "List recently finished tasks with their results, most recent first. \
         Use it to avoid repeating work you already did."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Max tasks (default 10, max 50)" }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let finished = self
            .scheduler
            .store()
            .list_recent_finished(&ctx.namespace, list_limit(&params))
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let tasks: Vec<serde_json::Value> = finished.iter().map(task_summary).collect();
        Ok(ToolOutput::success(
            serde_json::json!({ "tasks": tasks }),
            start.elapsed(),
        ))
    }
}

/// All scheduler tools, bound to one scheduler.
pub fn scheduler_tools(scheduler: &Arc<TaskScheduler>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(SchedulerAddTaskTool::new(Arc::clone(scheduler))),
        Arc::new(SchedulerDeleteTaskTool::new(Arc::clone(scheduler))),
        Arc::new(SchedulerGetScheduledTasksTool::new(Arc::clone(scheduler))),
        Arc::new(SchedulerGetCompletedTasksTool::new(Arc::clone(scheduler))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlTaskStore;

    async fn scheduler() -> Arc<TaskScheduler> {
        let store = LibSqlTaskStore::new_memory().await.unwrap();
        Arc::new(TaskScheduler::new(Arc::new(store), Duration::from_secs(2)))
    }

    #[tokio::test]
    async fn add_then_list_then_delete() {
        let scheduler = scheduler().await;
        let ctx = ToolContext::new("ns", "t");

        let added = SchedulerAddTaskTool::new(Arc::clone(&scheduler))
            .execute(
                serde_json::json!({"message": "check mentions", "scheduleOffsetSeconds": 300}),
                &ctx,
            )
            .await
            .unwrap();
        let id = added.result["taskId"].as_str().unwrap().to_string();

        let listed = SchedulerGetScheduledTasksTool::new(Arc::clone(&scheduler))
            .execute(serde_json::json!({}), &ctx)
            .await
            .unwrap();
        assert_eq!(listed.result["tasks"][0]["message"], "check mentions");

        SchedulerDeleteTaskTool::new(Arc::clone(&scheduler))
            .execute(serde_json::json!({"taskId": id}), &ctx)
            .await
            .unwrap();
        let queue = scheduler.get_task_queue("ns").await.unwrap();
        assert!(queue.scheduled.is_empty());
    }

    #[tokio::test]
    async fn add_rejects_empty_message() {
        let scheduler = scheduler().await;
        let ctx = ToolContext::new("ns", "t");
        let err = SchedulerAddTaskTool::new(scheduler)
            .execute(serde_json::json!({"message": "  "}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn add_rejects_offsets_past_the_horizon() {
        let scheduler = scheduler().await;
        let ctx = ToolContext::new("ns", "t");
        let tool = SchedulerAddTaskTool::new(Arc::clone(&scheduler));

        for offset in [serde_json::json!(u64::MAX), serde_json::json!(-5)] {
            let err = tool
                .execute(
                    serde_json::json!({"message": "far away", "scheduleOffsetSeconds": offset}),
                    &ctx,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, ToolError::InvalidParameters(_)));
        }
        let queue = scheduler.get_task_queue("ns").await.unwrap();
        assert!(queue.scheduled.is_empty());
    }

    #[tokio::test]
    async fn completed_tasks_include_results() {
        let scheduler = scheduler().await;
        let task = scheduler
            .schedule_task("ns", "post update", chrono::Utc::now())
            .await
            .unwrap();
        scheduler.claim_next("ns").await.unwrap();
        scheduler
            .complete_task("ns", task.id, serde_json::json!({"summary": "posted"}))
            .await
            .unwrap();

        let ctx = ToolContext::new("ns", "t");
        let out = SchedulerGetCompletedTasksTool::new(Arc::clone(&scheduler))
            .execute(serde_json::json!({"limit": 5}), &ctx)
            .await
            .unwrap();
        let first = &out.result["tasks"][0];
        assert_eq!(first["status"], "completed");
        assert_eq!(first["result"]["summary"], "posted");
    }

    #[tokio::test]
    async fn delete_of_unknown_id_fails() {
        let scheduler = scheduler().await;
        let ctx = ToolContext::new("ns", "t");
        let tool = SchedulerDeleteTaskTool::new(scheduler);
        assert!(
            tool.execute(serde_json::json!({"taskId": Uuid::new_v4().to_string()}), &ctx)
                .await
                .is_err()
        );
        assert!(matches!(
            tool.execute(serde_json::json!({"taskId": "nope"}), &ctx).await,
            Err(ToolError::InvalidParameters(_))
        ));
    }
}
