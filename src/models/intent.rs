// Request and intent classification types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::agent::{AgentCapability, AgentId};

/// An incoming request to be classified and executed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    pub request_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub context: Value,
    pub received_at: DateTime<Utc>,
}

impl UserRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            content: content.into(),
            context: Value::Null,
            received_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    SalesInquiry,
    CustomerSupport,
    TechnicalService,
    ManagementDecision,
    /// Default route when no intent is confident enough
    GeneralInquiry,
    CollaborationRequired,
}

impl IntentType {
    pub const ALL: [IntentType; 6] = [
        IntentType::SalesInquiry,
        IntentType::CustomerSupport,
        IntentType::TechnicalService,
        IntentType::ManagementDecision,
        IntentType::GeneralInquiry,
        IntentType::CollaborationRequired,
    ];
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntentType::SalesInquiry => "sales_inquiry",
            IntentType::CustomerSupport => "customer_support",
            IntentType::TechnicalService => "technical_service",
            IntentType::ManagementDecision => "management_decision",
            IntentType::GeneralInquiry => "general_inquiry",
            IntentType::CollaborationRequired => "collaboration_required",
        };
        f.write_str(name)
    }
}

/// A candidate agent for a classified request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSuggestion {
    pub agent_id: AgentId,
    pub capability: AgentCapability,
    pub confidence: f64,
    pub priority: u32,
}

/// Outcome of intent classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent_type: IntentType,
    pub confidence: f64,
    /// Ranked, best first
    pub suggested_agents: Vec<AgentSuggestion>,
    pub requires_collaboration: bool,
    /// True when the router fell back to the default route
    #[serde(default)]
    pub fallback: bool,
    #[serde(default)]
    pub reasoning: String,
}

impl IntentResult {
    pub fn top_agent(&self) -> Option<&AgentSuggestion> {
        self.suggested_agents.first()
    }
}
