// Orchestrator context
// Explicit wiring of every shared component, built once at startup

//! # Orchestrator Context
//!
//! [`Orchestrator`] owns the registry, the provider pool, the router, the
//! coordinator and the engine. Nothing is global: the binary builds one
//! context from [`OrchestratorConfig`] and passes it around.
//!
//! ```text
//! handle(request)
//!   classify  → IntentResult
//!   plan_for  → WorkflowPlan
//!   start     → workflow id
//!   wait      → WorkflowState (terminal or paused)
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Arc for Shared Ownership
//! The pool is referenced by every `LlmAgent` and by the context itself;
//! the registry by the router and the coordinator. `Arc` keeps one instance
//! alive for as long as any of them needs it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::agents::{AgentAdapter, AgentRegistration, AgentRegistry, LlmAgent};
use crate::engine::coordinator::AgentCoordinator;
use crate::engine::events::EventBus;
use crate::engine::router::IntentRouter;
use crate::engine::storage::{InMemoryStateStore, StateStore};
use crate::engine::workflow::WorkflowEngine;
use crate::llm::pool::ModelProviderPool;
use crate::models::{IntentResult, UserRequest, WorkflowState};
use crate::settings::OrchestratorConfig;
use crate::Result;

/// A handled request: how it was routed and how its workflow ended
#[derive(Debug, Clone)]
pub struct Handled {
    pub intent: IntentResult,
    pub state: WorkflowState,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    pool: Arc<ModelProviderPool>,
    registry: Arc<AgentRegistry>,
    router: IntentRouter,
    coordinator: Arc<AgentCoordinator>,
    engine: WorkflowEngine,
}

impl Orchestrator {
    /// Build every component from configuration, with an in-memory state store
    pub async fn from_config(config: OrchestratorConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(InMemoryStateStore::default())).await
    }

    pub async fn with_store(config: OrchestratorConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(ModelProviderPool::from_configs(
            config.pool.clone(),
            config.providers.clone(),
        )?);

        let mut registry = AgentRegistry::new();
        for agent in &config.agents {
            let adapter: Arc<dyn AgentAdapter> = Arc::new(
                LlmAgent::new(agent.agent_id.clone(), agent.system_prompt.clone(), pool.clone())
                    .with_model(agent.model_name.clone())
                    .with_provider(agent.provider_id.clone())
                    .with_sampling(agent.max_tokens, agent.temperature),
            );
            registry.register(
                AgentRegistration::new(agent.agent_id.clone(), agent.capability, agent.priority, adapter)
                    .with_max_concurrent_tasks(agent.max_concurrent_tasks),
            )?;
        }
        let registry = Arc::new(registry);

        let router = IntentRouter::new(registry.clone(), config.router.clone());
        let coordinator = Arc::new(AgentCoordinator::new(registry.clone(), config.coordinator.clone()));
        let engine = WorkflowEngine::new(coordinator.clone(), store, EventBus::default(), config.engine.clone());

        info!(
            providers = config.providers.len(),
            agents = registry.len(),
            "Orchestrator initialized"
        );
        Ok(Self {
            config,
            pool,
            registry,
            router,
            coordinator,
            engine,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ModelProviderPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &IntentRouter {
        &self.router
    }

    pub fn coordinator(&self) -> &Arc<AgentCoordinator> {
        &self.coordinator
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Route, plan and start a request without waiting for it
    pub async fn submit(&self, request: &UserRequest) -> Result<(IntentResult, Uuid)> {
        let intent = self.router.classify(request).await;
        let plan = self.coordinator.plan_for(request, &intent)?;
        let workflow_id = self.engine.start(plan).await?;
        info!(
            request_id = %request.request_id,
            %workflow_id,
            intent = %intent.intent_type,
            fallback = intent.fallback,
            "Request accepted"
        );
        Ok((intent, workflow_id))
    }

    /// Route, plan and run a request to the end
    pub async fn handle(&self, request: UserRequest) -> Result<Handled> {
        let (intent, workflow_id) = self.submit(&request).await?;
        let state = self.engine.wait(workflow_id).await?;
        Ok(Handled { intent, state })
    }

    /// Park running workflows at their next stage boundary
    pub async fn shutdown(&self, timeout: Duration) {
        let stuck = self.engine.shutdown(timeout).await;
        if stuck.is_empty() {
            info!("Orchestrator shut down cleanly");
        } else {
            warn!(count = stuck.len(), "Workflows still running at shutdown");
        }
    }
}
