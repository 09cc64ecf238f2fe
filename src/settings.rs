// Orchestrator configuration
// Layered settings: defaults, then an optional file, then ORCHESTRATOR__* variables

//! # Settings
//!
//! [`OrchestratorConfig`] gathers the configuration of every component in
//! one serde tree. Each section defaults field by field, so a file only
//! needs the values it changes:
//!
//! ```toml
//! [engine]
//! cancel_grace_ms = 2000
//!
//! [[providers]]
//! provider_id = "deepseek"
//! endpoint = "https://api.deepseek.com/v1"
//! model_name = "deepseek-chat"
//! api_key_env = "DEEPSEEK_API_KEY"
//! weight = 3
//! ```
//!
//! Environment variables override the file, using `__` as the section
//! separator: `ORCHESTRATOR__ENGINE__CANCEL_GRACE_MS=2000`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::coordinator::CoordinatorConfig;
use crate::engine::router::RouterConfig;
use crate::engine::workflow::EngineConfig;
use crate::llm::{PoolConfig, ProviderConfig, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use crate::models::{AgentCapability, AgentId};
use crate::{OrchestratorError, Result};

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "ORCHESTRATOR";

/// One LLM-backed agent instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: AgentId,
    pub capability: AgentCapability,
    /// Static priority; higher wins ties
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_agent_concurrency")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub system_prompt: String,
    /// Overrides the provider's model
    #[serde(default)]
    pub model_name: Option<String>,
    /// Preferred provider
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_agent_concurrency() -> usize {
    5
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<AgentId>, capability: AgentCapability, system_prompt: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capability,
            priority: 0,
            max_concurrent_tasks: default_agent_concurrency(),
            system_prompt: system_prompt.into(),
            model_name: None,
            provider_id: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub engine: EngineConfig,
    pub router: RouterConfig,
    pub coordinator: CoordinatorConfig,
    pub pool: PoolConfig,
    pub providers: Vec<ProviderConfig>,
    pub agents: Vec<AgentConfig>,
}

impl Default for OrchestratorConfig {
    /// Runs without any external service: one mock provider and one agent per capability
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            router: RouterConfig::default(),
            coordinator: CoordinatorConfig::default(),
            pool: PoolConfig::default(),
            providers: vec![ProviderConfig::mock("local")],
            agents: vec![
                AgentConfig::new(
                    "coordinator-1",
                    AgentCapability::Coordinator,
                    "You break requests into sub-tasks and merge the answers.",
                ),
                AgentConfig::new(
                    "sales-1",
                    AgentCapability::Sales,
                    "You recommend products and pricing plans.",
                )
                .with_priority(2),
                AgentConfig::new(
                    "manager-1",
                    AgentCapability::Manager,
                    "You approve offers, discounts and escalations.",
                )
                .with_priority(3),
                AgentConfig::new(
                    "field-1",
                    AgentCapability::FieldService,
                    "You assess installations, outages and on-site work.",
                )
                .with_priority(2),
                AgentConfig::new(
                    "support-1",
                    AgentCapability::CustomerSupport,
                    "You answer account, billing and general questions.",
                )
                .with_priority(1),
            ],
        }
    }
}

impl OrchestratorConfig {
    /// Load defaults, then `path` if given, then environment overrides
    ///
    /// The file format follows its extension (TOML, JSON or YAML). A missing
    /// file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: OrchestratorConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the components would refuse or misbehave on
    pub fn validate(&self) -> Result<()> {
        let mut provider_ids = HashSet::new();
        for provider in &self.providers {
            if !provider_ids.insert(provider.provider_id.as_str()) {
                return invalid(format!("duplicate provider id '{}'", provider.provider_id));
            }
            if provider.weight == 0 {
                return invalid(format!("provider '{}' has weight 0", provider.provider_id));
            }
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if !agent_ids.insert(&agent.agent_id) {
                return invalid(format!("duplicate agent id '{}'", agent.agent_id));
            }
            if agent.max_concurrent_tasks == 0 {
                return invalid(format!("agent '{}' allows no concurrent tasks", agent.agent_id));
            }
            if let Some(provider) = &agent.provider_id {
                if !provider_ids.contains(provider.as_str()) {
                    return invalid(format!(
                        "agent '{}' prefers unknown provider '{}'",
                        agent.agent_id, provider
                    ));
                }
            }
        }
        if !self.agents.is_empty() && self.providers.is_empty() {
            return invalid("agents are configured but no model provider is".to_string());
        }

        let quorum = self.coordinator.default_quorum;
        if !(quorum > 0.0 && quorum <= 1.0) {
            return invalid(format!("coordinator.default_quorum must be in (0, 1], got {}", quorum));
        }

        let unit_range = [
            ("router.min_confidence", self.router.min_confidence),
            ("router.epsilon", self.router.epsilon),
            ("router.collaboration_threshold", self.router.collaboration_threshold),
            ("coordinator.epsilon", self.coordinator.epsilon),
            ("coordinator.collaboration_threshold", self.coordinator.collaboration_threshold),
            ("coordinator.validation.confidence_floor", self.coordinator.validation.confidence_floor),
        ];
        for (name, value) in unit_range {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{} must be in [0, 1], got {}", name, value));
            }
        }

        if self.engine.max_concurrent_tasks == Some(0) {
            return invalid("engine.max_concurrent_tasks must be at least 1".to_string());
        }
        Ok(())
    }
}

fn invalid(message: String) -> Result<()> {
    Err(OrchestratorError::Config(message))
}
