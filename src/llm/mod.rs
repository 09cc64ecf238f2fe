// Model provider layer
// Interchangeable model backends behind one health-aware call interface

//! # Model Provider Pool
//!
//! Agents never talk to a model backend directly. They call
//! [`pool::ModelProviderPool::call`], which:
//!
//! 1. Dedups identical in-flight requests through the fingerprint cache
//! 2. Ranks providers: probe-eligible first, then weighted round-robin over
//!    CLOSED providers
//! 3. Retries transient failures against the same provider with backoff
//! 4. Fails over to the next provider, recording a [`pool::FailoverEvent`]
//! 5. Returns [`ModelProviderError::Unavailable`] once every provider is
//!    exhausted or open
//!
//! Each provider owns a [`breaker::CircuitBreaker`] that is updated only when
//! a call completes or fails.

pub mod breaker;
pub mod fingerprint;
pub mod pool;
pub mod providers;
pub mod traits;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use breaker::{CircuitState, ProviderHealth};
pub use traits::ModelProviderClient;

/// Default completion budget
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// A model call as issued by an agent adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Idempotency key, echoed in the response
    pub request_id: Uuid,
    /// Preferred provider; ranked first when it is healthy
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Overrides the provider's configured model
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            provider_id: None,
            model_name: None,
            system_prompt: None,
            prompt: prompt.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_name = Some(model.into());
        self
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub request_id: Uuid,
    pub provider_id: String,
    pub model_name: String,
    pub content: String,
    pub latency_ms: u64,
    /// Provider attempts spent on this call, including failed ones
    pub attempts: u32,
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
    /// Last error seen before the successful attempt
    #[serde(default)]
    pub error: Option<String>,
}

/// What a provider client returns for one successful attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub content: String,
    pub model_name: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// Errors from a single provider attempt or from the pool as a whole
///
/// `Clone` so that one in-flight result can be handed to every caller
/// waiting on the same fingerprint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelProviderError {
    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No provider available after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ModelProviderError {
    /// Worth retrying against the same provider
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModelProviderError::Timeout(_)
                | ModelProviderError::Server { .. }
                | ModelProviderError::Network(_)
        )
    }

    /// Counts as a consecutive failure for the circuit breaker
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            ModelProviderError::Timeout(_)
                | ModelProviderError::Server { .. }
                | ModelProviderError::Network(_)
                | ModelProviderError::QuotaExhausted(_)
        )
    }

    /// No other provider would accept this request either
    pub fn is_fatal_for_request(&self) -> bool {
        matches!(self, ModelProviderError::InvalidRequest(_))
    }

    /// Map an HTTP status to an error
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 | 404 | 422 => ModelProviderError::InvalidRequest(message),
            401 | 403 => ModelProviderError::Authentication(message),
            408 => ModelProviderError::Timeout(message),
            429 => ModelProviderError::QuotaExhausted(message),
            500..=599 => ModelProviderError::Server { status, message },
            _ => ModelProviderError::InvalidResponse(format!("HTTP {}: {}", status, message)),
        }
    }
}

/// Result type for model provider operations
pub type ModelResult<T> = Result<T, ModelProviderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Any backend exposing `/chat/completions`
    OpenaiCompatible,
    /// Scripted in-process backend for demos and tests
    Mock,
}

impl Default for ProviderKind {
    fn default() -> Self {
        ProviderKind::OpenaiCompatible
    }
}

/// Circuit breaker thresholds for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub base_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown_ms: 30_000,
            max_cooldown_ms: 300_000,
        }
    }
}

/// One configured backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    #[serde(default)]
    pub kind: ProviderKind,
    /// Relative share of traffic among healthy providers
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub model_name: String,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Maximum concurrent in-flight calls
    #[serde(default)]
    pub rate_limit: Option<usize>,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_weight() -> u32 {
    1
}

impl ProviderConfig {
    pub fn new(provider_id: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            kind: ProviderKind::default(),
            weight: default_weight(),
            endpoint: None,
            model_name: model_name.into(),
            api_key_env: None,
            rate_limit: None,
            breaker: BreakerConfig::default(),
        }
    }

    pub fn mock(provider_id: impl Into<String>) -> Self {
        let mut config = Self::new(provider_id, "mock-model");
        config.kind = ProviderKind::Mock;
        config
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

/// Pool-wide call policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Retries against the same provider after the first attempt
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_ms: u64,
    /// Zero disables the fingerprint cache
    pub fingerprint_ttl_ms: u64,
    pub failover_log_capacity: usize,
    pub health_check_concurrency: usize,
    pub health_check_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay_ms: 200,
            request_timeout_ms: 30_000,
            fingerprint_ttl_ms: 30_000,
            failover_log_capacity: 100,
            health_check_concurrency: 5,
            health_check_timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let server = ModelProviderError::from_status(503, "unavailable");
        assert!(server.is_transient());
        assert!(server.counts_toward_breaker());

        let quota = ModelProviderError::from_status(429, "slow down");
        assert!(!quota.is_transient());
        assert!(quota.counts_toward_breaker());

        let bad = ModelProviderError::from_status(400, "bad prompt");
        assert!(bad.is_fatal_for_request());
        assert!(!bad.counts_toward_breaker());
    }

    #[test]
    fn test_provider_config_defaults_from_json() {
        let config: ProviderConfig = serde_json::from_value(serde_json::json!({
            "provider_id": "qwen",
            "model_name": "qwen-max"
        }))
        .unwrap();
        assert_eq!(config.weight, 1);
        assert_eq!(config.kind, ProviderKind::OpenaiCompatible);
        assert_eq!(config.breaker.failure_threshold, 5);
    }
}
