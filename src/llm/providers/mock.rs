//! Scripted in-process provider
//! Used by the CLI demo configuration and throughout the test suite

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::traits::ModelProviderClient;
use crate::llm::{ModelProviderError, ModelRequest, ModelResult, ProviderReply};

/// What the mock does once its script runs out
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Reply with the last line of the prompt
    Echo,
    Fixed(String),
    AlwaysFail(ModelProviderError),
}

pub struct MockProviderClient {
    provider_id: String,
    behavior: MockBehavior,
    script: Mutex<VecDeque<ModelResult<String>>>,
    latency: Duration,
    calls: AtomicU32,
}

impl MockProviderClient {
    pub fn new(provider_id: impl Into<String>, behavior: MockBehavior) -> Self {
        Self {
            provider_id: provider_id.into(),
            behavior,
            script: Mutex::new(VecDeque::new()),
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn echo(provider_id: impl Into<String>) -> Self {
        Self::new(provider_id, MockBehavior::Echo)
    }

    pub fn failing(provider_id: impl Into<String>, error: ModelProviderError) -> Self {
        Self::new(provider_id, MockBehavior::AlwaysFail(error))
    }

    /// Queue outcomes consumed in order before the fallback behavior applies
    pub fn with_script(self, outcomes: Vec<ModelResult<String>>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(outcomes);
        }
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of attempts received so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, request: &ModelRequest) -> ModelResult<String> {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        if let Some(outcome) = scripted {
            return outcome;
        }

        match &self.behavior {
            MockBehavior::Echo => Ok(request
                .prompt
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or_default()
                .trim()
                .to_string()),
            MockBehavior::Fixed(content) => Ok(content.clone()),
            MockBehavior::AlwaysFail(error) => Err(error.clone()),
        }
    }
}

#[async_trait]
impl ModelProviderClient for MockProviderClient {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, request: &ModelRequest) -> ModelResult<ProviderReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let content = self.next_outcome(request)?;
        Ok(ProviderReply {
            prompt_tokens: Some(request.prompt.split_whitespace().count() as u32),
            completion_tokens: Some(content.split_whitespace().count() as u32),
            model_name: request
                .model_name
                .clone()
                .unwrap_or_else(|| self.default_model().to_string()),
            content,
        })
    }
}
