// Agent runtime adapters and the agent registry
// Uniform invoke contract over a closed, capability-tagged set of agents

//! # Agent Runtime
//!
//! Every agent is reached through [`AgentAdapter::invoke`]. The
//! [`AgentRegistry`] maps agent ids and capabilities to adapters, carries the
//! static priority used for tie-breaks, and enforces a concurrency cap per
//! agent type that is shared by every workflow in the process.
//!
//! [`LlmAgent`] is the stock adapter: it renders a prompt from the
//! [`AgentInput`] and calls the [`ModelProviderPool`]. Adapters are the only
//! code that talks to the pool.
//!
//! ## Response Format
//!
//! `LlmAgent` accepts either plain text (confidence falls back to the
//! configured default) or a JSON object:
//!
//! ```json
//! {"content": "...", "confidence": 0.82, "collaboration_needed": false,
//!  "next_actions": [{"action_type": "schedule_visit"}]}
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::llm::pool::ModelProviderPool;
use crate::llm::ModelRequest;
use crate::models::{AgentCapability, AgentId, AgentInput, AgentResponse, NextAction};
use crate::{OrchestratorError, Result};

/// Contract implemented by every agent
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Run the agent once; implementations should stop early when `cancel` fires
    async fn invoke(&self, input: AgentInput, cancel: CancellationToken) -> Result<AgentResponse>;
}

#[derive(Clone)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub capability: AgentCapability,
    /// Static priority; higher wins tie-breaks
    pub priority: u32,
    pub max_concurrent_tasks: usize,
    pub adapter: Arc<dyn AgentAdapter>,
}

impl AgentRegistration {
    pub fn new(
        agent_id: impl Into<AgentId>,
        capability: AgentCapability,
        priority: u32,
        adapter: Arc<dyn AgentAdapter>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            capability,
            priority,
            max_concurrent_tasks: 5,
            adapter,
        }
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }
}

/// Decrements an agent's in-flight counter when dropped
struct WorkloadGuard<'a> {
    workload: &'a DashMap<AgentId, usize>,
    agent_id: AgentId,
}

impl Drop for WorkloadGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.workload.get_mut(&self.agent_id) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Registry of agents, built at startup and read-only afterwards
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<AgentRegistration>,
    type_limits: HashMap<AgentCapability, (usize, Arc<Semaphore>)>,
    workload: DashMap<AgentId, usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent; its `max_concurrent_tasks` adds to its type's shared cap
    pub fn register(&mut self, registration: AgentRegistration) -> Result<()> {
        if self.get(&registration.agent_id).is_some() {
            return Err(OrchestratorError::Config(format!(
                "agent '{}' registered twice",
                registration.agent_id
            )));
        }

        let permits = registration.max_concurrent_tasks.max(1);
        self.type_limits
            .entry(registration.capability)
            .and_modify(|(limit, semaphore)| {
                *limit += permits;
                semaphore.add_permits(permits);
            })
            .or_insert_with(|| (permits, Arc::new(Semaphore::new(permits))));

        debug!(
            agent_id = %registration.agent_id,
            capability = %registration.capability,
            priority = registration.priority,
            "Agent registered"
        );
        self.agents.push(registration);
        Ok(())
    }

    pub fn with(mut self, registration: AgentRegistration) -> Result<Self> {
        self.register(registration)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Registrations in registration order
    pub fn agents(&self) -> &[AgentRegistration] {
        &self.agents
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<&AgentRegistration> {
        self.agents.iter().find(|a| &a.agent_id == agent_id)
    }

    pub fn priority_of(&self, agent_id: &AgentId) -> u32 {
        self.get(agent_id).map_or(0, |a| a.priority)
    }

    /// Agents with `capability`, highest priority first, then registration order
    pub fn by_capability(&self, capability: AgentCapability) -> Vec<&AgentRegistration> {
        let mut matches: Vec<&AgentRegistration> = self
            .agents
            .iter()
            .filter(|a| a.capability == capability)
            .collect();
        matches.sort_by(|a, b| b.priority.cmp(&a.priority));
        matches
    }

    pub fn primary(&self, capability: AgentCapability) -> Option<&AgentRegistration> {
        self.by_capability(capability).into_iter().next()
    }

    /// Best agent of the same capability other than `excluding`
    pub fn alternate(&self, capability: AgentCapability, excluding: &AgentId) -> Option<&AgentRegistration> {
        self.by_capability(capability)
            .into_iter()
            .find(|a| &a.agent_id != excluding)
    }

    /// Shared concurrency cap for an agent type
    pub fn type_limit(&self, capability: AgentCapability) -> usize {
        self.type_limits.get(&capability).map_or(0, |(limit, _)| *limit)
    }

    /// In-flight invocations per agent
    pub fn workload(&self) -> HashMap<AgentId, usize> {
        self.workload
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    async fn acquire(&self, capability: AgentCapability) -> Result<OwnedSemaphorePermit> {
        let (_, semaphore) = self.type_limits.get(&capability).ok_or_else(|| {
            OrchestratorError::AgentUnavailable(format!("no agent registered for {}", capability))
        })?;
        semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| OrchestratorError::AgentUnavailable(e.to_string()))
    }

    /// Invoke a registered agent under its type's concurrency cap
    pub async fn invoke(
        &self,
        agent_id: &AgentId,
        input: AgentInput,
        cancel: CancellationToken,
    ) -> Result<AgentResponse> {
        let registration = self
            .get(agent_id)
            .ok_or_else(|| OrchestratorError::AgentUnavailable(format!("agent '{}' is not registered", agent_id)))?;

        let _permit = tokio::select! {
            permit = self.acquire(registration.capability) => permit?,
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::Cancelled(format!("waiting for a {} slot", registration.capability)));
            }
        };

        *self.workload.entry(agent_id.clone()).or_insert(0) += 1;
        let _workload = WorkloadGuard {
            workload: &self.workload,
            agent_id: agent_id.clone(),
        };

        let mut response = registration.adapter.invoke(input, cancel).await?;
        response.agent_id = agent_id.clone();
        Ok(response)
    }
}

/// Agent backed by the model provider pool
pub struct LlmAgent {
    agent_id: AgentId,
    system_prompt: String,
    model_name: Option<String>,
    provider_id: Option<String>,
    max_tokens: u32,
    temperature: f32,
    default_confidence: f64,
    pool: Arc<ModelProviderPool>,
}

impl LlmAgent {
    pub fn new(agent_id: impl Into<AgentId>, system_prompt: impl Into<String>, pool: Arc<ModelProviderPool>) -> Self {
        Self {
            agent_id: agent_id.into(),
            system_prompt: system_prompt.into(),
            model_name: None,
            provider_id: None,
            max_tokens: crate::llm::DEFAULT_MAX_TOKENS,
            temperature: crate::llm::DEFAULT_TEMPERATURE,
            default_confidence: 0.8,
            pool,
        }
    }

    pub fn with_model(mut self, model_name: Option<String>) -> Self {
        self.model_name = model_name;
        self
    }

    pub fn with_provider(mut self, provider_id: Option<String>) -> Self {
        self.provider_id = provider_id;
        self
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn with_default_confidence(mut self, confidence: f64) -> Self {
        self.default_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Render the prompt; the instruction always comes last
    fn render_prompt(&self, input: &AgentInput) -> String {
        let mut prompt = format!("Task: {}\n", input.task);
        if !input.context.is_null() {
            prompt.push_str(&format!("Context: {}\n", input.context));
        }
        if !input.previous.is_null() {
            prompt.push_str(&format!("Previous findings: {}\n", input.previous));
        }
        if input.attempt > 0 {
            // Also keeps re-runs out of the fingerprint cache
            prompt.push_str(&format!(
                "Attempt {}: the previous answer was not confident enough, re-check it.\n",
                input.attempt + 1
            ));
        }
        prompt.push('\n');
        prompt.push_str(&input.instruction);
        prompt
    }

    fn parse_response(&self, content: &str) -> AgentResponse {
        let parsed = serde_json::from_str::<Value>(content.trim())
            .ok()
            .and_then(|v| v.as_object().cloned())
            .filter(|o| o.get("content").map_or(false, Value::is_string));

        let Some(object) = parsed else {
            return AgentResponse::new(self.agent_id.clone(), content.trim(), self.default_confidence);
        };

        let text = object.get("content").and_then(Value::as_str).unwrap_or_default();
        let confidence = object
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(self.default_confidence);
        let mut response = AgentResponse::new(self.agent_id.clone(), text, confidence);
        response.collaboration_needed = object
            .get("collaboration_needed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if let Some(actions) = object.get("next_actions") {
            match serde_json::from_value::<Vec<NextAction>>(actions.clone()) {
                Ok(actions) => response.next_actions = actions,
                Err(e) => warn!(agent_id = %self.agent_id, "Ignoring malformed next_actions: {}", e),
            }
        }
        response
    }
}

#[async_trait]
impl AgentAdapter for LlmAgent {
    async fn invoke(&self, input: AgentInput, cancel: CancellationToken) -> Result<AgentResponse> {
        let mut request = ModelRequest::new(self.render_prompt(&input)).with_system_prompt(self.system_prompt.clone());
        request.model_name = self.model_name.clone();
        request.provider_id = self.provider_id.clone();
        request.max_tokens = self.max_tokens;
        request.temperature = self.temperature;

        let model_response = tokio::select! {
            result = self.pool.call(request) => result?,
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::Cancelled(format!("agent '{}' cancelled", self.agent_id)));
            }
        };

        let mut response = self.parse_response(&model_response.content);
        response
            .metadata
            .insert("provider_id".to_string(), Value::from(model_response.provider_id));
        response
            .metadata
            .insert("model_name".to_string(), Value::from(model_response.model_name));
        response
            .metadata
            .insert("latency_ms".to_string(), Value::from(model_response.latency_ms));
        response
            .metadata
            .insert("model_attempts".to_string(), Value::from(model_response.attempts));
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::providers::{MockBehavior, MockProviderClient};
    use crate::llm::traits::ModelProviderClient;
    use crate::llm::{ModelProviderError, PoolConfig, ProviderConfig};
    use std::time::Duration;
    use uuid::Uuid;

    struct FixedAgent(&'static str);

    #[async_trait]
    impl AgentAdapter for FixedAgent {
        async fn invoke(&self, _input: AgentInput, _cancel: CancellationToken) -> Result<AgentResponse> {
            Ok(AgentResponse::new("ignored", self.0, 0.9))
        }
    }

    struct SlowAgent;

    #[async_trait]
    impl AgentAdapter for SlowAgent {
        async fn invoke(&self, _input: AgentInput, cancel: CancellationToken) -> Result<AgentResponse> {
            cancel.cancelled().await;
            Err(OrchestratorError::Cancelled("slow".to_string()))
        }
    }

    fn input(instruction: &str) -> AgentInput {
        AgentInput {
            workflow_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            task: "pricing".to_string(),
            question: instruction.to_string(),
            instruction: instruction.to_string(),
            previous: Value::Null,
            context: Value::Null,
            attempt: 0,
        }
    }

    fn pool_with(client: MockProviderClient) -> Arc<ModelProviderPool> {
        let id = client.provider_id().to_string();
        let client: Arc<dyn ModelProviderClient> = Arc::new(client);
        Arc::new(ModelProviderPool::with_clients(
            PoolConfig {
                fingerprint_ttl_ms: 0,
                retry_base_delay_ms: 1,
                ..PoolConfig::default()
            },
            vec![(ProviderConfig::mock(id), client)],
        ))
    }

    #[test]
    fn test_registry_orders_by_priority_then_registration() {
        let registry = AgentRegistry::new()
            .with(AgentRegistration::new("sales-low", AgentCapability::Sales, 1, Arc::new(FixedAgent("a"))))
            .unwrap()
            .with(AgentRegistration::new("sales-high", AgentCapability::Sales, 9, Arc::new(FixedAgent("b"))))
            .unwrap()
            .with(AgentRegistration::new("sales-mid", AgentCapability::Sales, 1, Arc::new(FixedAgent("c"))))
            .unwrap();

        let ids: Vec<&str> = registry
            .by_capability(AgentCapability::Sales)
            .iter()
            .map(|a| a.agent_id.as_str())
            .collect();
        assert_eq!(ids, vec!["sales-high", "sales-low", "sales-mid"]);
        assert_eq!(
            registry
                .alternate(AgentCapability::Sales, &AgentId::from("sales-high"))
                .map(|a| a.agent_id.as_str()),
            Some("sales-low")
        );
        assert!(registry.primary(AgentCapability::Manager).is_none());
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = AgentRegistry::new();
        registry
            .register(AgentRegistration::new("a", AgentCapability::Sales, 1, Arc::new(FixedAgent("x"))))
            .unwrap();
        assert!(registry
            .register(AgentRegistration::new("a", AgentCapability::Manager, 1, Arc::new(FixedAgent("y"))))
            .is_err());
    }

    #[test]
    fn test_type_limit_sums_agents_of_a_type() {
        let registry = AgentRegistry::new()
            .with(
                AgentRegistration::new("s1", AgentCapability::Sales, 1, Arc::new(FixedAgent("x")))
                    .with_max_concurrent_tasks(2),
            )
            .unwrap()
            .with(
                AgentRegistration::new("s2", AgentCapability::Sales, 1, Arc::new(FixedAgent("y")))
                    .with_max_concurrent_tasks(3),
            )
            .unwrap();
        assert_eq!(registry.type_limit(AgentCapability::Sales), 5);
        assert_eq!(registry.type_limit(AgentCapability::Manager), 0);
    }

    #[tokio::test]
    async fn test_invoke_stamps_agent_id_and_tracks_workload() {
        let registry = AgentRegistry::new()
            .with(AgentRegistration::new("sales-1", AgentCapability::Sales, 1, Arc::new(FixedAgent("quote"))))
            .unwrap();

        let response = registry
            .invoke(&AgentId::from("sales-1"), input("price?"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.agent_id, AgentId::from("sales-1"));
        assert_eq!(registry.workload().get(&AgentId::from("sales-1")), Some(&0));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_unavailable() {
        let registry = AgentRegistry::new();
        let err = registry
            .invoke(&AgentId::from("ghost"), input("?"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AgentUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_cap_is_shared_and_cancellable() {
        let registry = Arc::new(
            AgentRegistry::new()
                .with(
                    AgentRegistration::new("slow", AgentCapability::Manager, 1, Arc::new(SlowAgent))
                        .with_max_concurrent_tasks(1),
                )
                .unwrap(),
        );

        let first_cancel = CancellationToken::new();
        let busy = {
            let registry = registry.clone();
            let cancel = first_cancel.clone();
            tokio::spawn(async move { registry.invoke(&AgentId::from("slow"), input("a"), cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.workload().get(&AgentId::from("slow")), Some(&1));

        // No slot left: the second caller waits until it is cancelled
        let waiting_cancel = CancellationToken::new();
        let waiting = {
            let registry = registry.clone();
            let cancel = waiting_cancel.clone();
            tokio::spawn(async move { registry.invoke(&AgentId::from("slow"), input("b"), cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiting_cancel.cancel();
        assert!(matches!(
            waiting.await.unwrap(),
            Err(OrchestratorError::Cancelled(_))
        ));

        first_cancel.cancel();
        assert!(busy.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_llm_agent_parses_structured_reply() {
        let pool = pool_with(MockProviderClient::new(
            "m",
            MockBehavior::Fixed(
                r#"{"content": "Plan B costs 40", "confidence": 0.91, "collaboration_needed": true,
                    "next_actions": [{"action_type": "send_quote"}]}"#
                    .to_string(),
            ),
        ));
        let agent = LlmAgent::new("sales-1", "You are a sales agent", pool);

        let response = agent.invoke(input("price?"), CancellationToken::new()).await.unwrap();
        assert_eq!(response.content, "Plan B costs 40");
        assert_eq!(response.confidence, 0.91);
        assert!(response.collaboration_needed);
        assert_eq!(response.next_actions[0].action_type, "send_quote");
        assert_eq!(response.metadata["provider_id"], "m");
    }

    #[tokio::test]
    async fn test_llm_agent_plain_text_uses_default_confidence() {
        let pool = pool_with(MockProviderClient::echo("m"));
        let agent = LlmAgent::new("support-1", "You are support", pool).with_default_confidence(0.7);

        let mut request = input("How do I reset my router?");
        request.previous = serde_json::json!("earlier answer");
        let response = agent.invoke(request, CancellationToken::new()).await.unwrap();
        assert_eq!(response.content, "How do I reset my router?");
        assert_eq!(response.confidence, 0.7);
    }

    #[tokio::test]
    async fn test_llm_agent_surfaces_pool_exhaustion() {
        let pool = pool_with(MockProviderClient::failing(
            "m",
            ModelProviderError::Server {
                status: 503,
                message: "down".to_string(),
            },
        ));
        let agent = LlmAgent::new("sales-1", "", pool);
        let err = agent.invoke(input("?"), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ModelUnavailable { .. }));
    }

    #[test]
    fn test_rerun_prompt_differs_and_keeps_instruction_last() {
        let agent = LlmAgent::new("a", "", pool_with(MockProviderClient::echo("m")));
        let first = input("Which plan?");
        let mut second = first.clone();
        second.attempt = 1;

        let (p1, p2) = (agent.render_prompt(&first), agent.render_prompt(&second));
        assert_ne!(p1, p2);
        assert!(p2.ends_with("Which plan?"));
    }
}
