// Agent Orchestrator - Rust Edition
// Multi-agent workflow orchestration with health-aware model routing

//! # Agent Orchestrator Library
//!
//! This is the library root for the orchestration engine. A request flows
//! through four cooperating components:
//!
//! ```text
//! UserRequest
//!   ↓ classified by
//! IntentRouter            (engine::router)
//!   ↓ planned by
//! AgentCoordinator        (engine::coordinator)
//!   ↓ executed by
//! WorkflowEngine          (engine::workflow)
//!   ↓ each step invokes an
//! AgentAdapter            (engine::agents)
//!   ↓ which may call the
//! ModelProviderPool       (llm::pool)
//! ```
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`WorkflowState`]: the persisted, versioned state of one workflow run
//! - [`ExecutionStep`]: one dispatched agent invocation
//! - [`WorkflowPlan`]: phases of agent assignments plus a quorum
//! - [`AgentResponse`]: the output of an agent invocation
//!
//! ### Workflow Engine
//! Drives the `PENDING → RUNNING → {PAUSED ⇄ RUNNING} → terminal` state machine
//! under Sequential, Parallel or Hierarchical topology and persists a snapshot
//! after every transition.
//!
//! ### Model Provider Pool
//! Weighted round-robin over healthy providers with a circuit breaker per
//! provider, bounded retries, failover and single-flight request dedup.
//!
//! ## Rust Learning Notes:
//!
//! ### Explicit Context Instead of Globals
//! Every shared component lives behind an `Arc` inside [`Orchestrator`],
//! which is built once at startup and handed to whoever needs it. There is
//! no `lazy_static` or other ambient global state.
//!
//! ### Re-exports
//! `pub use` statements give callers a flat API, so
//! `use agent_orchestrator::WorkflowEngine` works without knowing the
//! module layout.

pub mod context;
pub mod engine;
pub mod llm;
pub mod models;
pub mod settings;

pub use settings::OrchestratorConfig;
pub use context::{Handled, Orchestrator};

pub use models::{
    AgentCapability, AgentId, AgentInput, AgentResponse, Assignment, ExecutionStep, IntentResult,
    IntentType, NextAction, Phase, StageOutcome, StepError, StepStatus, SubTask, Task, TaskKind,
    TaskPriority, Topology, UserRequest, WorkflowPlan, WorkflowResult, WorkflowState,
    WorkflowStatus,
};

pub use engine::{
    agents::{AgentAdapter, AgentRegistration, AgentRegistry, LlmAgent},
    coordinator::{AgentCoordinator, Resolution},
    events::{EventBus, WorkflowEvent},
    router::{IntentRouter, IntentScorer, KeywordScorer},
    storage::{InMemoryStateStore, StateStore},
    validation::{ResultValidator, Verdict},
    workflow::{EngineConfig, WorkflowEngine},
};

pub use llm::{
    pool::ModelProviderPool, ModelProviderError, ModelRequest, ModelResponse, PoolConfig,
    ProviderConfig,
};

// Core error types
use thiserror::Error;

/// Errors raised by the orchestration core
///
/// One variant per failure class a caller can observe. Variants that are
/// persisted inside a [`WorkflowState`] are first converted to a
/// [`StepError`] via [`OrchestratorError::to_step_error`].
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Intent classification failed; callers always degrade to the default route
    #[error("Intent routing failed: {0}")]
    IntentRouting(String),

    /// No registered instance can serve the capability or agent id
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    /// A single provider call failed
    #[error("Model provider error: {0}")]
    ModelProvider(llm::ModelProviderError),

    /// Every provider in the pool is exhausted or open
    #[error("Model unavailable after {attempts} attempts: {message}")]
    ModelUnavailable { attempts: u32, message: String },

    /// A step or phase deadline elapsed
    #[error("Deadline of {timeout_ms}ms exceeded for {scope}")]
    WorkflowTimeout { scope: String, timeout_ms: u64 },

    /// Tied responses that could not be resolved by confidence or priority
    #[error("Unresolved aggregation conflict on '{question}' between {agents:?}")]
    AggregationConflict { question: String, agents: Vec<String> },

    /// The state store could not be written after all retries
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Optimistic concurrency check in the state store failed
    #[error("Version conflict for workflow {workflow_id}: expected {expected}, found {found}")]
    VersionConflict {
        workflow_id: String,
        expected: u64,
        found: u64,
    },

    /// Error when a control operation does not fit the workflow state machine
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Plan rejected at validation time (cycles, bad quorum, empty phases)
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Agent-specific failure reported by an adapter
    #[error("Agent {agent_id} failed: {message}")]
    Agent { agent_id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<llm::ModelProviderError> for OrchestratorError {
    fn from(err: llm::ModelProviderError) -> Self {
        match err {
            llm::ModelProviderError::Unavailable { attempts, message } => {
                OrchestratorError::ModelUnavailable { attempts, message }
            }
            other => OrchestratorError::ModelProvider(other),
        }
    }
}

impl From<::config::ConfigError> for OrchestratorError {
    fn from(err: ::config::ConfigError) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

impl OrchestratorError {
    /// Convert into the serialisable error recorded on steps and workflows
    pub fn to_step_error(&self) -> StepError {
        use models::ErrorKind;

        let (kind, recoverable) = match self {
            OrchestratorError::IntentRouting(_) => (ErrorKind::IntentRouting, true),
            OrchestratorError::AgentUnavailable(_) => (ErrorKind::AgentUnavailable, true),
            OrchestratorError::ModelProvider(_) => (ErrorKind::ModelProvider, true),
            OrchestratorError::ModelUnavailable { .. } => (ErrorKind::ModelUnavailable, true),
            OrchestratorError::WorkflowTimeout { .. } => (ErrorKind::Timeout, true),
            OrchestratorError::AggregationConflict { .. } => {
                (ErrorKind::AggregationConflict, true)
            }
            OrchestratorError::Persistence(_) | OrchestratorError::VersionConflict { .. } => {
                (ErrorKind::Persistence, false)
            }
            OrchestratorError::Cancelled(_) => (ErrorKind::Cancelled, false),
            OrchestratorError::Agent { .. } => (ErrorKind::Agent, true),
            _ => (ErrorKind::Internal, false),
        };

        StepError {
            kind,
            message: self.to_string(),
            recoverable,
        }
    }
}

/// Type alias for Results using our error type
pub type Result<T> = std::result::Result<T, OrchestratorError>;
