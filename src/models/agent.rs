// Agent domain types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a registered agent instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declared capability of an agent
///
/// The set is closed: every agent registers under exactly one of these tags
/// and is resolved through the registry, never by name reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCapability {
    Coordinator,
    Sales,
    Manager,
    FieldService,
    CustomerSupport,
}

impl AgentCapability {
    pub const ALL: [AgentCapability; 5] = [
        AgentCapability::Coordinator,
        AgentCapability::Sales,
        AgentCapability::Manager,
        AgentCapability::FieldService,
        AgentCapability::CustomerSupport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentCapability::Coordinator => "coordinator",
            AgentCapability::Sales => "sales",
            AgentCapability::Manager => "manager",
            AgentCapability::FieldService => "field_service",
            AgentCapability::CustomerSupport => "customer_support",
        }
    }
}

impl fmt::Display for AgentCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Follow-up suggested by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    pub action_type: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub description: String,
}

/// Input handed to an agent adapter for one invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInput {
    pub workflow_id: Uuid,
    pub step_id: Uuid,
    /// Description of the overall task
    pub task: String,
    /// Sub-question this invocation answers
    pub question: String,
    pub instruction: String,
    /// Output of the previous stage, `Null` for the first stage or after a degraded step
    pub previous: Value,
    /// Free-form request context (customer id, channel, ...)
    #[serde(default)]
    pub context: Value,
    /// Re-run counter, 0 for the first attempt
    #[serde(default)]
    pub attempt: u32,
}

/// Output of one agent invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent_id: AgentId,
    pub content: String,
    /// Self-reported confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub next_actions: Vec<NextAction>,
    #[serde(default)]
    pub collaboration_needed: bool,
    /// Set when the response was accepted below the confidence floor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limitations: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl AgentResponse {
    pub fn new(agent_id: impl Into<AgentId>, content: impl Into<String>, confidence: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            content: content.into(),
            confidence: confidence.clamp(0.0, 1.0),
            next_actions: vec![],
            collaboration_needed: false,
            limitations: None,
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_next_action(mut self, action: NextAction) -> Self {
        self.next_actions.push(action);
        self
    }

    pub fn needing_collaboration(mut self) -> Self {
        self.collaboration_needed = true;
        self
    }
}
