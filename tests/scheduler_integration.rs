//! End-to-end checks of the scheduler, store and workflow engine working
//! together.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use agent_orchestrator::config::{EngineConfig, PruningParameters};
use agent_orchestrator::error::{DatabaseError, Error, LlmError, SchedulerError, WorkflowError};
use agent_orchestrator::llm::{ChatMessage, ToolCall, ToolDefinition};
use agent_orchestrator::memory::LibSqlMemoryStore;
use agent_orchestrator::runner::{OrchestratorRunner, RunnerOptions};
use agent_orchestrator::scheduler::{
    StatusUpdate, Task, TaskExecutor, TaskScheduler, TaskStatus,
};
use agent_orchestrator::store::{LibSqlTaskStore, TaskStore};
use agent_orchestrator::tools::ToolDispatcher;
use agent_orchestrator::tools::ToolRegistry;
use agent_orchestrator::tools::builtin::register_builtin_tools;
use agent_orchestrator::workflow::{
    ConversationWindow, Decision, DecisionStep, FinishStep, FinishedWorkflow, SummaryStep,
    WorkflowControl, WorkflowEngine, WorkflowSteps,
};

async fn scheduler() -> (Arc<TaskScheduler>, Arc<dyn TaskStore>, LibSqlMemoryStore) {
    let store = LibSqlTaskStore::new_memory().await.unwrap();
    let memory = LibSqlMemoryStore::new(store.connection());
    let store: Arc<dyn TaskStore> = Arc::new(store);
    let scheduler = Arc::new(TaskScheduler::new(
        Arc::clone(&store),
        StdDuration::from_millis(50),
    ));
    (scheduler, store, memory)
}

// ── Single flight ───────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_claims_yield_one_task_per_namespace() {
    let (scheduler, store, _) = scheduler().await;
    let past = Utc::now() - Duration::seconds(5);
    for ns in ["alpha", "beta"] {
        for i in 0..5 {
            scheduler
                .schedule_task(ns, &format!("{ns}-{i}"), past)
                .await
                .unwrap();
        }
    }

    let mut handles = Vec::new();
    for i in 0..40 {
        let scheduler = Arc::clone(&scheduler);
        let ns = if i % 2 == 0 { "alpha" } else { "beta" };
        handles.push(tokio::spawn(async move {
            scheduler.claim_next(ns).await.unwrap().map(|t| t.namespace)
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(ns) = handle.await.unwrap() {
            claimed.push(ns);
        }
    }
    claimed.sort();
    assert_eq!(claimed, vec!["alpha".to_string(), "beta".to_string()]);

    for ns in ["alpha", "beta"] {
        let processing = store
            .list_by_status(ns, &[TaskStatus::Processing], None, None)
            .await
            .unwrap();
        assert_eq!(processing.len(), 1, "namespace {ns}");
    }
}

#[tokio::test]
async fn claim_is_released_only_by_a_terminal_write() {
    let (scheduler, _, _) = scheduler().await;
    let past = Utc::now() - Duration::seconds(1);
    scheduler.schedule_task("ns", "first", past).await.unwrap();
    scheduler.schedule_task("ns", "second", past).await.unwrap();

    let first = scheduler.claim_next("ns").await.unwrap().unwrap();
    assert!(scheduler.claim_next("ns").await.unwrap().is_none());

    scheduler
        .fail_task("ns", first.id, "did not work")
        .await
        .unwrap();
    let second = scheduler.claim_next("ns").await.unwrap().unwrap();
    assert_eq!(second.message, "second");
}

// ── Due time ────────────────────────────────────────────────────────

#[tokio::test]
async fn next_due_never_returns_future_tasks() {
    let (_, store, _) = scheduler().await;
    let now = Utc::now();
    for offset in [-30, -1, 1, 30, 3600] {
        store
            .create_task("ns", &format!("at {offset}"), now + Duration::seconds(offset))
            .await
            .unwrap();
    }

    let due = store.get_due_at("ns", now, 10).await.unwrap();
    assert_eq!(due.len(), 2);
    assert!(due.iter().all(|t| t.scheduled_for <= now));
    assert_eq!(due[0].message, "at -30");
}

// ── Cancellation ────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_task_is_never_claimed() {
    let (scheduler, _, _) = scheduler().await;
    let task = scheduler
        .schedule_task("ns", "cancel me", Utc::now() - Duration::seconds(1))
        .await
        .unwrap();

    scheduler.delete_task("ns", task.id).await.unwrap();

    let queue = scheduler.get_task_queue("ns").await.unwrap();
    assert!(queue.scheduled.iter().all(|t| t.id != task.id));
    assert!(scheduler.claim_next("ns").await.unwrap().is_none());
}

#[tokio::test]
async fn in_flight_task_cannot_be_cancelled() {
    let (scheduler, _, _) = scheduler().await;
    scheduler
        .schedule_task("ns", "running", Utc::now() - Duration::seconds(1))
        .await
        .unwrap();
    let task = scheduler.claim_next("ns").await.unwrap().unwrap();

    let err = scheduler.delete_task("ns", task.id).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::NotCancellable {
            status: TaskStatus::Processing,
            ..
        }
    ));
}

// ── Termination ─────────────────────────────────────────────────────

/// Always asks for one more `thinking` call.
struct Relentless {
    decisions: AtomicU32,
}

#[async_trait]
impl DecisionStep for Relentless {
    async fn decide(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<Decision, LlmError> {
        let n = self.decisions.fetch_add(1, Ordering::SeqCst);
        Ok(Decision::ToolCalls {
            content: None,
            calls: vec![ToolCall {
                id: format!("call-{n}"),
                name: "thinking".into(),
                arguments: serde_json::json!({ "thought": "keep going" }),
            }],
        })
    }
}

#[async_trait]
impl SummaryStep for Relentless {
    async fn summarize(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        Ok(format!("{} messages", messages.len()))
    }
}

#[async_trait]
impl FinishStep for Relentless {
    async fn finish(
        &self,
        _messages: &[ChatMessage],
        _control: &WorkflowControl,
    ) -> Result<FinishedWorkflow, LlmError> {
        Ok(FinishedWorkflow::summary_only("unreachable"))
    }
}

#[tokio::test]
async fn recursion_limit_fails_the_task() {
    let (scheduler, store, memory) = scheduler().await;
    let tools = Arc::new(ToolRegistry::new());
    register_builtin_tools(&tools, &scheduler);

    let steps = Arc::new(Relentless {
        decisions: AtomicU32::new(0),
    });
    let engine = WorkflowEngine::new(
        WorkflowSteps::from_single(Arc::clone(&steps)),
        Arc::new(ToolDispatcher::new(tools, 4)),
        EngineConfig {
            recursion_limit: 3,
            ..EngineConfig::default()
        },
    );
    let runner = OrchestratorRunner::new(
        "ns",
        Arc::clone(&scheduler),
        Arc::new(memory),
        engine,
        RunnerOptions::default(),
    );

    let task = scheduler
        .schedule_task("ns", "never stop", Utc::now() - Duration::seconds(1))
        .await
        .unwrap();
    let ran = tokio::time::timeout(StdDuration::from_secs(10), runner.execute_next())
        .await
        .expect("run must terminate");
    assert_eq!(ran.unwrap(), Some(task.id));
    assert_eq!(steps.decisions.load(Ordering::SeqCst), 3);

    let stored = store.get_by_id("ns", task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(
        stored
            .error
            .as_deref()
            .unwrap()
            .contains("EngineRecursionExceeded")
    );
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn interactive_run_reports_recursion_error() {
    let (scheduler, _, memory) = scheduler().await;
    let tools = Arc::new(ToolRegistry::new());
    register_builtin_tools(&tools, &scheduler);
    let engine = WorkflowEngine::new(
        WorkflowSteps::from_single(Arc::new(Relentless {
            decisions: AtomicU32::new(0),
        })),
        Arc::new(ToolDispatcher::new(tools, 4)),
        EngineConfig {
            recursion_limit: 2,
            ..EngineConfig::default()
        },
    );
    let runner = OrchestratorRunner::new(
        "ns",
        scheduler,
        Arc::new(memory),
        engine,
        RunnerOptions::default(),
    );

    let err = runner.run_workflow(Some("loop")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Workflow(WorkflowError::RecursionExceeded { limit: 2 })
    ));
}

// ── Round trip ──────────────────────────────────────────────────────

#[tokio::test]
async fn create_get_update_round_trip() {
    let (_, store, _) = scheduler().await;
    let t = Utc::now() + Duration::minutes(5);
    let task = store.create_task("ns", "m", t).await.unwrap();

    let loaded = store.get_by_id("ns", task.id).await.unwrap().unwrap();
    assert_eq!(loaded.message, "m");
    assert_eq!(loaded.scheduled_for, t);

    let changed = store
        .update_status(
            "ns",
            task.id,
            TaskStatus::Completed,
            StatusUpdate::completed(serde_json::json!("X")),
        )
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let loaded = store.get_by_id("ns", task.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Completed);
    assert_eq!(loaded.result, Some(serde_json::json!("X")));
}

// ── Pruning ─────────────────────────────────────────────────────────

struct CountSummary;

#[async_trait]
impl SummaryStep for CountSummary {
    async fn summarize(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        Ok(format!("{} messages", messages.len()))
    }
}

fn tool_pair(id: &str) -> (ChatMessage, ChatMessage) {
    (
        ChatMessage::assistant_with_tool_calls(
            None,
            vec![ToolCall {
                id: id.into(),
                name: "thinking".into(),
                arguments: serde_json::json!({}),
            }],
        ),
        ChatMessage::tool_result(id, "thinking", "ok"),
    )
}

#[tokio::test]
async fn pruning_never_splits_a_tool_pair() {
    let params = PruningParameters {
        max_window_summary: 5,
        max_queue_size: 10,
    };

    // The call/result pair is placed at every position in m1..m7.
    for call_at in 0..6 {
        let mut window = ConversationWindow::new(params);
        let mut i = 0;
        while i < 7 {
            if i == call_at {
                let (call, result) = tool_pair("pair");
                window.push(call);
                window.push(result);
                i += 2;
            } else {
                window.push(ChatMessage::user(format!("m{}", i + 1)));
                i += 1;
            }
        }
        assert_eq!(window.len(), 7);

        window.prune(&CountSummary).await.unwrap();
        assert!(window.len() <= 5, "call at {call_at}: {} entries", window.len());

        let has_call = window.messages().iter().any(|m| m.has_tool_calls());
        let has_result = window
            .messages()
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some("pair"));
        assert_eq!(has_call, has_result, "call at {call_at} was split");
    }
}

#[tokio::test]
async fn pruning_example_m1_to_m7() {
    let mut window = ConversationWindow::new(PruningParameters {
        max_window_summary: 5,
        max_queue_size: 10,
    });
    let (m3, m4) = tool_pair("m3");
    window.push(ChatMessage::user("m1"));
    window.push(ChatMessage::assistant("m2"));
    window.push(m3);
    window.push(m4);
    window.push(ChatMessage::user("m5"));
    window.push(ChatMessage::assistant("m6"));
    window.push(ChatMessage::user("m7"));

    window.prune(&CountSummary).await.unwrap();

    assert!(window.len() <= 5);
    let m3_present = window.messages().iter().any(|m| m.has_tool_calls());
    let m4_present = window
        .messages()
        .iter()
        .any(|m| m.tool_call_id.as_deref() == Some("m3"));
    assert_eq!(m3_present, m4_present);
    assert_eq!(window.messages().last().unwrap().content, "m7");
}

// ── Ordering ────────────────────────────────────────────────────────

#[tokio::test]
async fn earlier_due_task_is_claimed_first() {
    let (scheduler, store, _) = scheduler().await;
    let t = Utc::now();
    let a = scheduler
        .schedule_task("ns", "A", t + Duration::seconds(5))
        .await
        .unwrap();
    let b = scheduler
        .schedule_task("ns", "B", t + Duration::seconds(1))
        .await
        .unwrap();

    let due = store
        .get_due_at("ns", t + Duration::seconds(2), 10)
        .await
        .unwrap();
    assert_eq!(due.iter().map(|task| task.id).collect::<Vec<_>>(), vec![b.id]);

    let mut order = Vec::new();
    let at = t + Duration::seconds(6);
    while let Some(task) = scheduler.claim_next_at("ns", at).await.unwrap() {
        order.push(task.message.clone());
        scheduler
            .complete_task("ns", task.id, serde_json::json!("done"))
            .await
            .unwrap();
    }
    assert_eq!(order, vec!["B", "A"]);

    let queue = scheduler.get_task_queue("ns").await.unwrap();
    assert!(queue.scheduled.is_empty());
    assert_eq!(queue.completed.len(), 2);
    assert!(queue.completed.iter().any(|t| t.id == a.id));
}

// ── Observability ───────────────────────────────────────────────────

#[tokio::test]
async fn mutations_are_visible_immediately() {
    let (scheduler, _, _) = scheduler().await;
    let mut events = scheduler.subscribe();

    let task = scheduler.schedule_immediate("ns", "soon").await.unwrap();
    let queue = scheduler.get_task_queue("ns").await.unwrap();
    assert_eq!(queue.scheduled.len(), 1);
    assert_eq!(queue.scheduled[0].id, task.id);
    assert!(task.scheduled_for > task.created_at);

    let event = events.recv().await.unwrap();
    assert_eq!(event.namespace(), "ns");
}

// ── Storage failures ────────────────────────────────────────────────

/// Delegates to a real store, failing a set number of due-task reads and
/// terminal status writes first.
struct FlakyStore {
    inner: Arc<dyn TaskStore>,
    due_failures: AtomicU32,
    terminal_failures: AtomicU32,
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn unavailable() -> DatabaseError {
    DatabaseError::Query("database is locked".into())
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create_task(
        &self,
        namespace: &str,
        message: &str,
        scheduled_for: chrono::DateTime<Utc>,
    ) -> Result<Task, DatabaseError> {
        self.inner.create_task(namespace, message, scheduled_for).await
    }

    async fn update_status(
        &self,
        namespace: &str,
        id: Uuid,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<u64, DatabaseError> {
        self.inner.update_status(namespace, id, status, update).await
    }

    async fn transition(
        &self,
        namespace: &str,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        update: StatusUpdate,
    ) -> Result<u64, DatabaseError> {
        if to.is_terminal() && take_failure(&self.terminal_failures) {
            return Err(unavailable());
        }
        self.inner.transition(namespace, id, from, to, update).await
    }

    async fn get_by_id(&self, namespace: &str, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.inner.get_by_id(namespace, id).await
    }

    async fn list_by_status(
        &self,
        namespace: &str,
        statuses: &[TaskStatus],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.inner
            .list_by_status(namespace, statuses, limit, offset)
            .await
    }

    async fn get_due_at(
        &self,
        namespace: &str,
        now: chrono::DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        if take_failure(&self.due_failures) {
            return Err(unavailable());
        }
        self.inner.get_due_at(namespace, now, limit).await
    }

    async fn delete_task(&self, namespace: &str, id: Uuid) -> Result<u64, DatabaseError> {
        self.inner.delete_task(namespace, id).await
    }

    async fn list_recent_finished(
        &self,
        namespace: &str,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.inner.list_recent_finished(namespace, limit).await
    }
}

/// Stops on the first decision.
struct StopsAtOnce;

#[async_trait]
impl DecisionStep for StopsAtOnce {
    async fn decide(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<Decision, LlmError> {
        Ok(Decision::Stop {
            reason: "nothing to do".into(),
        })
    }
}

#[async_trait]
impl SummaryStep for StopsAtOnce {
    async fn summarize(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
        Ok("summary".into())
    }
}

#[async_trait]
impl FinishStep for StopsAtOnce {
    async fn finish(
        &self,
        _messages: &[ChatMessage],
        _control: &WorkflowControl,
    ) -> Result<FinishedWorkflow, LlmError> {
        Ok(FinishedWorkflow::summary_only("all quiet"))
    }
}

async fn flaky_runner(
    due_failures: u32,
    terminal_failures: u32,
    terminal_write_attempts: u32,
) -> (OrchestratorRunner, Arc<TaskScheduler>, Arc<dyn TaskStore>) {
    let store = LibSqlTaskStore::new_memory().await.unwrap();
    let memory = LibSqlMemoryStore::new(store.connection());
    let store: Arc<dyn TaskStore> = Arc::new(FlakyStore {
        inner: Arc::new(store),
        due_failures: AtomicU32::new(due_failures),
        terminal_failures: AtomicU32::new(terminal_failures),
    });
    let scheduler = Arc::new(TaskScheduler::new(Arc::clone(&store), StdDuration::ZERO));
    let engine = WorkflowEngine::new(
        WorkflowSteps::from_single(Arc::new(StopsAtOnce)),
        Arc::new(ToolDispatcher::new(Arc::new(ToolRegistry::new()), 2)),
        EngineConfig::default(),
    );
    let runner = OrchestratorRunner::new(
        "ns",
        Arc::clone(&scheduler),
        Arc::new(memory),
        engine,
        RunnerOptions {
            self_schedule: false,
            terminal_write_attempts,
        },
    );
    (runner, scheduler, store)
}

#[tokio::test]
async fn failed_due_read_is_retried_on_the_next_tick() {
    let (runner, _, store) = flaky_runner(1, 0, 3).await;
    let task = runner
        .schedule_task("due", Utc::now() - Duration::seconds(1))
        .await
        .unwrap();

    let err = runner.execute_next().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Scheduler(SchedulerError::Storage(DatabaseError::Query(_)))
    ));
    let untouched = store.get_by_id("ns", task.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, TaskStatus::Scheduled);

    assert_eq!(runner.execute_next().await.unwrap(), Some(task.id));
    let done = store.get_by_id("ns", task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}

#[tokio::test]
async fn terminal_write_is_retried_until_it_lands() {
    let (runner, scheduler, store) = flaky_runner(0, 2, 3).await;
    let task = runner
        .schedule_task("due", Utc::now() - Duration::seconds(1))
        .await
        .unwrap();

    assert_eq!(runner.execute_next().await.unwrap(), Some(task.id));
    let done = store.get_by_id("ns", task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result.unwrap()["summary"], "all quiet");
    assert!(!scheduler.is_processing("ns").await);
}

#[tokio::test]
async fn exhausted_terminal_writes_do_not_wedge_the_namespace() {
    let (runner, scheduler, store) = flaky_runner(0, 2, 1).await;
    let first = runner
        .schedule_task("first", Utc::now() - Duration::seconds(2))
        .await
        .unwrap();
    let second = runner
        .schedule_task("second", Utc::now() - Duration::seconds(1))
        .await
        .unwrap();

    // The run ends but its terminal write is rejected.
    assert!(runner.execute_next().await.is_err());
    assert!(!scheduler.is_processing("ns").await);
    let stuck = store.get_by_id("ns", first.id).await.unwrap().unwrap();
    assert_eq!(stuck.status, TaskStatus::Processing);

    // The deferred write is rejected once more.
    assert!(runner.execute_next().await.is_err());

    // The store is healthy again: the first task settles, then the second runs.
    assert_eq!(runner.execute_next().await.unwrap(), Some(second.id));
    let first = store.get_by_id("ns", first.id).await.unwrap().unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(first.result.unwrap()["summary"], "all quiet");
    let second = store.get_by_id("ns", second.id).await.unwrap().unwrap();
    assert_eq!(second.status, TaskStatus::Completed);
    assert!(!scheduler.is_processing("ns").await);
    assert_eq!(runner.execute_next().await.unwrap(), None);
}
