// Core domain models for the orchestrator
// Plain data types shared by the router, coordinator, engine and pool

//! # Domain Models Module
//!
//! - [`agent`]: agent identity, capabilities, inputs and responses
//! - [`intent`]: incoming requests and classification results
//! - [`plan`]: tasks, sub-tasks and executable workflow plans
//! - [`workflow`]: persisted workflow state, steps and stage outcomes
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements below let callers write
//! `use agent_orchestrator::models::WorkflowState` instead of reaching into
//! `models::workflow::WorkflowState`.

pub mod agent;
pub mod intent;
pub mod plan;
pub mod workflow;

pub use agent::{AgentCapability, AgentId, AgentInput, AgentResponse, NextAction};

pub use intent::{AgentSuggestion, IntentResult, IntentType, UserRequest};

pub use plan::{
    dependency_levels, Assignment, Phase, SubTask, Task, TaskKind, TaskPriority, Topology,
    WorkflowPlan,
};

pub use workflow::{
    ConflictRecord, ConflictResolution, ErrorKind, ExecutionStep, ExecutionSummary, StageOutcome,
    StepError, StepStatus, WorkflowResult, WorkflowState, WorkflowStatus,
};
