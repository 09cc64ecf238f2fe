// Orchestration Engine
// Routing, planning, execution and persistence of multi-agent workflows

//! # Engine Module
//!
//! The engine is the layer between the domain models (in `models/`) and the
//! model providers (in `llm/`).
//!
//! ## Engine Components
//!
//! ### Intent Router (`router` module)
//! - Scores intents and suggests ranked agents
//! - Degrades to the default route instead of failing
//!
//! ### Agent Coordinator (`coordinator` module)
//! - Builds plans from classified requests and decomposes tasks into phases
//! - Resolves conflicting answers by confidence, then static priority
//! - Re-runs low-confidence answers through the `validation` gate
//!
//! ### Workflow Engine (`workflow` module)
//! - Runs the state machine for Sequential, Parallel and Hierarchical plans
//! - Bounded fan-out, quorum, deadlines, cooperative cancellation
//!
//! ### Agent Runtime (`agents` module)
//! - `AgentAdapter` contract and the capability-keyed registry
//!
//! ### Storage and Events (`storage`, `events` modules)
//! - Versioned state snapshots and a broadcast stream of workflow events
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects at the Seams
//! `Arc<dyn AgentAdapter>`, `Arc<dyn StateStore>` and `Arc<dyn IntentScorer>`
//! are the replaceable parts. Tests swap in scripted implementations without
//! touching the engine.

pub mod agents;
pub mod coordinator;
pub mod events;
pub mod router;
pub mod storage;
pub mod validation;
pub mod workflow;

#[cfg(test)]
mod tests;

pub use agents::{AgentAdapter, AgentRegistration, AgentRegistry, LlmAgent};
pub use coordinator::{AgentCoordinator, CoordinatorConfig, Resolution};
pub use events::{EventBus, WorkflowEvent};
pub use router::{IntentRouter, IntentRule, IntentScorer, KeywordScorer, RouterConfig};
pub use storage::{InMemoryStateStore, StateStore};
pub use validation::{ResultValidator, Verdict};
pub use workflow::{EngineConfig, WorkflowEngine};
