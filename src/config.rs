//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Bounds for a run's conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruningParameters {
    /// Window length above which the oldest block is summarized.
    pub max_window_summary: usize,
    /// Configured ceiling for `max_window_summary`, checked only by
    /// [`RunnerConfig::validate`]. Pruning itself reads `max_window_summary`.
    pub max_queue_size: usize,
}

impl Default for PruningParameters {
    fn default() -> Self {
        Self {
            max_window_summary: 30,
            max_queue_size: 50,
        }
    }
}

/// Workflow engine limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of `Input` visits before the run is aborted.
    pub recursion_limit: u32,
    /// Consecutive turns without tool calls before a stop is forced.
    pub idle_turn_limit: u32,
    /// Upper bound on concurrently executing tool calls within one step.
    pub max_tool_concurrency: usize,
    pub pruning: PruningParameters,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recursion_limit: 50,
            idle_turn_limit: 3,
            max_tool_concurrency: 4,
            pruning: PruningParameters::default(),
        }
    }
}

/// Runner configuration shared by every namespace.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Namespaces that get scheduler and execution loops at startup.
    pub namespaces: Vec<String>,
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    pub engine: EngineConfig,
    /// Interval of the scheduler tick.
    pub scheduler_tick: Duration,
    /// Interval of the execution tick.
    pub execution_tick: Duration,
    /// Delay applied by `schedule_immediate`.
    pub immediate_delay: Duration,
    /// Whether a finished run's follow-up prompt is scheduled automatically.
    pub self_schedule: bool,
    /// Attempts for terminal status writes.
    pub terminal_write_attempts: u32,
    /// Optional system prompt prepended to every LLM call.
    pub system_prompt: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            namespaces: vec!["default".to_string()],
            db_path: PathBuf::from("./data/orchestrator.db"),
            engine: EngineConfig::default(),
            scheduler_tick: Duration::from_secs(1),
            execution_tick: Duration::from_secs(1),
            immediate_delay: Duration::from_secs(2),
            self_schedule: true,
            terminal_write_attempts: 3,
            system_prompt: None,
        }
    }
}

impl RunnerConfig {
    /// Build configuration from `ORCHESTRATOR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("ORCHESTRATOR_NAMESPACES") {
            let namespaces: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if namespaces.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "ORCHESTRATOR_NAMESPACES".to_string(),
                    message: "at least one namespace is required".to_string(),
                });
            }
            config.namespaces = namespaces;
        }

        if let Ok(path) = std::env::var("ORCHESTRATOR_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Some(v) = parse_env("ORCHESTRATOR_RECURSION_LIMIT")? {
            config.engine.recursion_limit = v;
        }
        if let Some(v) = parse_env("ORCHESTRATOR_IDLE_TURN_LIMIT")? {
            config.engine.idle_turn_limit = v;
        }
        if let Some(v) = parse_env("ORCHESTRATOR_TOOL_CONCURRENCY")? {
            config.engine.max_tool_concurrency = v;
        }
        if let Some(v) = parse_env("ORCHESTRATOR_MAX_WINDOW_SUMMARY")? {
            config.engine.pruning.max_window_summary = v;
        }
        if let Some(v) = parse_env("ORCHESTRATOR_MAX_QUEUE_SIZE")? {
            config.engine.pruning.max_queue_size = v;
        }
        if let Some(ms) = parse_env::<u64>("ORCHESTRATOR_TICK_MS")? {
            config.scheduler_tick = Duration::from_millis(ms);
            config.execution_tick = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>("ORCHESTRATOR_IMMEDIATE_DELAY_MS")? {
            config.immediate_delay = Duration::from_millis(ms);
        }
        if let Some(v) = parse_env("ORCHESTRATOR_SELF_SCHEDULE")? {
            config.self_schedule = v;
        }
        if let Ok(prompt) = std::env::var("ORCHESTRATOR_SYSTEM_PROMPT") {
            config.system_prompt = Some(prompt);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pruning = &self.engine.pruning;
        if pruning.max_window_summary < 2 {
            return Err(invalid(
                "max_window_summary",
                "must be at least 2 to leave room for a summary and a new message",
            ));
        }
        if pruning.max_window_summary >= pruning.max_queue_size {
            return Err(invalid(
                "max_window_summary",
                format!(
                    "must be smaller than max_queue_size ({} >= {})",
                    pruning.max_window_summary, pruning.max_queue_size
                ),
            ));
        }
        if self.engine.recursion_limit == 0 {
            return Err(invalid("recursion_limit", "must be at least 1"));
        }
        if self.engine.max_tool_concurrency == 0 {
            return Err(invalid("max_tool_concurrency", "must be at least 1"));
        }
        if self.scheduler_tick.is_zero() || self.execution_tick.is_zero() {
            return Err(invalid("tick", "intervals must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, e.to_string())),
        Err(_) => Ok(None),
    }
}
