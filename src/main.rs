use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use agent_orchestrator::config::RunnerConfig;
use agent_orchestrator::llm::{LlmConfig, Reasoning, create_provider};
use agent_orchestrator::memory::{LibSqlMemoryStore, MemoryStore};
use agent_orchestrator::runner::RunnerRegistry;
use agent_orchestrator::scheduler::{TaskExecutor, TaskScheduler, spawn_namespace_loops};
use agent_orchestrator::store::{LibSqlTaskStore, TaskStore};
use agent_orchestrator::tools::ToolRegistry;
use agent_orchestrator::tools::builtin::register_builtin_tools;
use agent_orchestrator::workflow::WorkflowSteps;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Held for the process lifetime so buffered file logs are flushed.
    let _log_guard = init_tracing();

    let config = RunnerConfig::from_env().context("invalid orchestrator configuration")?;
    let llm_config = LlmConfig::from_env().context("LLM configuration")?;

    eprintln!("Agent orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Namespaces: {}", config.namespaces.join(", "));

    let llm = create_provider(&llm_config)?;
    let mut reasoning = Reasoning::new(llm);
    if let Some(prompt) = &config.system_prompt {
        reasoning = reasoning.with_system_prompt(prompt.clone());
    }

    // ── Storage ─────────────────────────────────────────────────────────
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tasks = LibSqlTaskStore::new_local(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    let memory: Arc<dyn MemoryStore> = Arc::new(LibSqlMemoryStore::new(tasks.connection()));
    let store: Arc<dyn TaskStore> = Arc::new(tasks);

    // ── Scheduler and tools ─────────────────────────────────────────────
    let scheduler = Arc::new(TaskScheduler::new(store, config.immediate_delay));
    let tools = Arc::new(ToolRegistry::new());
    register_builtin_tools(&tools, &scheduler);
    tracing::info!(tools = tools.len(), "Tool registry ready");

    let registry = RunnerRegistry::new(
        config.clone(),
        Arc::clone(&scheduler),
        memory,
        WorkflowSteps::from_single(Arc::new(reasoning)),
        tools,
    );

    // One-shot mode: run the given prompt in the first namespace and exit.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        let namespace = config
            .namespaces
            .first()
            .context("no namespace configured")?;
        let runner = registry.get(namespace).await?;
        let finished = runner.run_workflow(Some(&args.join(" "))).await?;
        println!("{}", serde_json::to_string_pretty(&finished)?);
        return Ok(());
    }

    // ── Loops ───────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = Vec::with_capacity(config.namespaces.len());
    for namespace in &config.namespaces {
        let runner = registry.get(namespace).await?;
        let executor: Arc<dyn TaskExecutor> = runner;
        loops.push(spawn_namespace_loops(
            Arc::clone(&scheduler),
            executor,
            config.scheduler_tick,
            config.execution_tick,
            shutdown_rx.clone(),
        ));
    }
    eprintln!("   Running. Press Ctrl-C to stop.\n");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Shutdown requested, waiting for in-flight runs");
    // Receivers observe the drop as well, so a failed send is harmless.
    let _ = shutdown_tx.send(true);
    for handle in loops {
        handle.join().await;
    }
    tracing::info!("Stopped");
    Ok(())
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("ORCHESTRATOR_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}
