//! LLM integration.
//!
//! The Anthropic Messages API is called directly over reqwest. `Reasoning`
//! sits on top of any `LlmProvider` and supplies the decision, summary and
//! finish steps of a workflow run.

pub mod anthropic;
pub mod prompts;
pub mod provider;
pub mod reasoning;

pub use anthropic::{AnthropicConfig, AnthropicProvider};
pub use provider::*;
pub use reasoning::{Reasoning, TokenUsage};

use std::sync::Arc;

use secrecy::SecretString;

use crate::error::{ConfigError, LlmError};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: Option<String>,
}

impl LlmConfig {
    /// Read `ANTHROPIC_API_KEY`, `ORCHESTRATOR_MODEL` and `ANTHROPIC_BASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;
        let model = std::env::var("ORCHESTRATOR_MODEL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Ok(Self {
            api_key: SecretString::from(api_key),
            model,
            base_url: std::env::var("ANTHROPIC_BASE_URL").ok(),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    if config.model.trim().is_empty() {
        return Err(LlmError::RequestFailed {
            provider: "anthropic".to_string(),
            reason: "model name is empty".to_string(),
        });
    }
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(AnthropicProvider::new(AnthropicConfig {
        api_key: config.api_key.clone(),
        model: config.model.clone(),
        base_url: config.base_url.clone(),
    })))
}
