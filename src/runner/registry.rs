//! Lazily built runners, one per namespace.
//!
//! The first caller for a namespace builds its runner; concurrent callers
//! wait on the same initialization and receive the same instance.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::info;

use crate::config::RunnerConfig;
use crate::error::Error;
use crate::memory::MemoryStore;
use crate::runner::facade::{OrchestratorRunner, RunnerOptions};
use crate::scheduler::TaskScheduler;
use crate::tools::{ToolDispatcher, ToolRegistry};
use crate::workflow::{WorkflowEngine, WorkflowSteps};

pub struct RunnerRegistry {
    config: RunnerConfig,
    scheduler: Arc<TaskScheduler>,
    memory: Arc<dyn MemoryStore>,
    steps: WorkflowSteps,
    dispatcher: Arc<ToolDispatcher>,
    runners: Mutex<HashMap<String, Arc<OnceCell<Arc<OrchestratorRunner>>>>>,
}

impl RunnerRegistry {
    pub fn new(
        config: RunnerConfig,
        scheduler: Arc<TaskScheduler>,
        memory: Arc<dyn MemoryStore>,
        steps: WorkflowSteps,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let dispatcher = Arc::new(ToolDispatcher::new(
            tools,
            config.engine.max_tool_concurrency,
        ));
        Self {
            config,
            scheduler,
            memory,
            steps,
            dispatcher,
            runners: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// The runner for `namespace`, built on first use.
    pub async fn get(&self, namespace: &str) -> Result<Arc<OrchestratorRunner>, Error> {
        let cell = {
            let mut runners = self.runners.lock().await;
            Arc::clone(runners.entry(namespace.to_string()).or_default())
        };
        let runner = cell.get_or_try_init(|| self.build(namespace)).await?;
        Ok(Arc::clone(runner))
    }

    /// Namespaces whose runner has been built.
    pub async fn namespaces(&self) -> Vec<String> {
        let runners = self.runners.lock().await;
        let mut names: Vec<String> = runners
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    async fn build(&self, namespace: &str) -> Result<Arc<OrchestratorRunner>, Error> {
        let recovered = self.scheduler.recover_stale(namespace).await?;
        let engine = WorkflowEngine::new(
            self.steps.clone(),
            Arc::clone(&self.dispatcher),
            self.config.engine.clone(),
        );
        let runner = OrchestratorRunner::new(
            namespace,
            Arc::clone(&self.scheduler),
            Arc::clone(&self.memory),
            engine,
            RunnerOptions {
                self_schedule: self.config.self_schedule,
                terminal_write_attempts: self.config.terminal_write_attempts,
            },
        );
        info!(namespace, recovered, "Runner ready");
        Ok(Arc::new(runner))
    }
}
