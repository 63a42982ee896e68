//! Workflow engine: drives one run from its seed message to a finished
//! result.
//!
//! The loop is Input → ToolExecution → MessageSummary → Input until the
//! decision step signals stop. Input visits are counted against the
//! recursion limit, so a run always terminates.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::WorkflowError;
use crate::llm::{ChatMessage, ToolCall};
use crate::memory::MemorySession;
use crate::tools::{ToolContext, ToolDispatcher};
use crate::workflow::conversation::ConversationWindow;
use crate::workflow::payload::{Decision, RunOutcome, WorkflowControl};
use crate::workflow::state::{Effect, Node, transition};
use crate::workflow::steps::WorkflowSteps;

const IDLE_NUDGE: &str =
    "Continue with the task using your tools, or call stop_workflow if there is nothing left to do.";

static LAST_THREAD_MICROS: AtomicU64 = AtomicU64::new(0);

/// Unique, monotonically increasing thread id for a run.
pub fn next_thread_id(namespace: &str) -> String {
    let now = Utc::now().timestamp_micros().max(0) as u64;
    let prev = LAST_THREAD_MICROS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or_else(|last| last);
    format!("{namespace}-{}", now.max(prev + 1))
}

/// Mutable state of a single run. Never shared between runs.
struct Run {
    thread_id: String,
    window: ConversationWindow,
    control: WorkflowControl,
    pending: Vec<ToolCall>,
    input_visits: u32,
    idle_turns: u32,
    tool_calls: usize,
    prunes: usize,
}

pub struct WorkflowEngine {
    steps: WorkflowSteps,
    dispatcher: Arc<ToolDispatcher>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(steps: WorkflowSteps, dispatcher: Arc<ToolDispatcher>, config: EngineConfig) -> Self {
        Self {
            steps,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the workflow for `seed` to completion.
    pub async fn run(
        &self,
        namespace: &str,
        seed: &str,
        memory: Option<Arc<dyn MemorySession>>,
    ) -> Result<RunOutcome, WorkflowError> {
        let thread_id = next_thread_id(namespace);
        let mut ctx = ToolContext::new(namespace, thread_id.clone());
        if let Some(memory) = memory {
            ctx = ctx.with_memory(memory);
        }

        let mut run = Run {
            thread_id,
            window: ConversationWindow::seeded(ChatMessage::user(seed), self.config.pruning),
            control: WorkflowControl::default(),
            pending: Vec::new(),
            input_visits: 0,
            idle_turns: 0,
            tool_calls: 0,
            prunes: 0,
        };
        info!(namespace, thread_id = %run.thread_id, "Workflow started");

        let mut node = Node::Input;
        let mut effect = Effect::Decide;
        loop {
            debug!(thread_id = %run.thread_id, ?node, "Entering node");
            match effect {
                Effect::Decide => self.decide(&mut run).await?,
                Effect::DispatchTools => self.dispatch(&mut run, &ctx).await,
                Effect::Prune => {
                    let folded = run
                        .window
                        .prune(self.steps.summary.as_ref())
                        .await
                        .map_err(WorkflowError::Summary)?;
                    run.prunes += 1;
                    debug!(thread_id = %run.thread_id, folded, len = run.window.len(), "Pruned window");
                }
                Effect::Skip => {}
                Effect::Finish => break,
            }
            (node, effect) = transition(node, &run.window, &run.control, run.pending.len());
        }

        let finished = self
            .steps
            .finish
            .finish(run.window.messages(), &run.control)
            .await
            .map_err(WorkflowError::Finish)?;

        info!(
            namespace,
            thread_id = %run.thread_id,
            input_visits = run.input_visits,
            tool_calls = run.tool_calls,
            "Workflow finished"
        );
        Ok(RunOutcome {
            thread_id: run.thread_id,
            finished,
            stop_reason: run.control.reason,
            input_visits: run.input_visits,
            tool_calls: run.tool_calls,
            prunes: run.prunes,
        })
    }

    async fn decide(&self, run: &mut Run) -> Result<(), WorkflowError> {
        if run.input_visits >= self.config.recursion_limit {
            warn!(thread_id = %run.thread_id, limit = self.config.recursion_limit, "Recursion limit reached");
            return Err(WorkflowError::RecursionExceeded {
                limit: self.config.recursion_limit,
            });
        }
        run.input_visits += 1;

        let tools = self.dispatcher.registry().tool_definitions().await;
        let decision = self
            .steps
            .decision
            .decide(run.window.messages(), &tools)
            .await
            .map_err(WorkflowError::Decision)?;

        match decision {
            Decision::ToolCalls { content, calls } => {
                run.idle_turns = 0;
                run.window
                    .push(ChatMessage::assistant_with_tool_calls(content, calls.clone()));
                run.pending = calls;
            }
            Decision::Stop { reason } => {
                info!(thread_id = %run.thread_id, %reason, "Decision step requested stop");
                run.control.stop(reason);
            }
            Decision::Respond { content } => {
                run.idle_turns += 1;
                if !content.is_empty() {
                    run.window.push(ChatMessage::assistant(content));
                }
                if run.idle_turns >= self.config.idle_turn_limit {
                    run.control.stop(format!(
                        "No tool calls in {} consecutive turns",
                        run.idle_turns
                    ));
                } else {
                    run.window.push(ChatMessage::user(IDLE_NUDGE));
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, run: &mut Run, ctx: &ToolContext) {
        let calls = std::mem::take(&mut run.pending);
        let results = self.dispatcher.dispatch(&calls, ctx).await;
        let failed = results.iter().filter(|r| r.is_error()).count();
        debug!(thread_id = %run.thread_id, calls = results.len(), failed, "Tool step done");
        run.tool_calls += results.len();
        run.window.extend(
            results
                .iter()
                .map(|r| ChatMessage::tool_result(&r.call_id, &r.name, r.content())),
        );
    }
}
