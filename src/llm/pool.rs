// Model Provider Pool
// Health-aware routing across interchangeable model backends

//! # Model Provider Pool
//!
//! ## Provider Ranking
//!
//! For every call the pool ranks its providers:
//!
//! 1. An explicitly requested provider, if it is admissible
//! 2. Providers whose breaker is OPEN with an elapsed cooldown (the probe)
//! 3. One CLOSED provider chosen by smooth weighted round-robin
//! 4. The remaining CLOSED providers by descending weight
//!
//! Providers still cooling down are skipped. If nothing is left the call
//! fails immediately with [`ModelProviderError::Unavailable`].
//!
//! ## Retry and Failover
//!
//! Transient errors (timeouts, 5xx, network) are retried against the same
//! provider up to `max_retries` times with exponential backoff. Any other
//! error, an exhausted retry budget or a breaker that opened mid-call moves
//! on to the next ranked provider. The total number of attempts is bounded
//! by `(max_retries + 1) × providers`.
//!
//! ## Hot Reload
//!
//! [`ModelProviderPool::reload`] swaps the provider list atomically. Calls
//! already in flight finish against the snapshot they started with.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::breaker::{Admission, CircuitBreaker, CircuitState, ProbeGuard, ProviderHealth};
use super::fingerprint::{fingerprint, SingleFlightCache};
use super::providers::build_client;
use super::traits::ModelProviderClient;
use super::{
    ModelProviderError, ModelRequest, ModelResponse, ModelResult, PoolConfig, ProviderConfig,
    ProviderReply,
};

/// Record of traffic moving from one provider to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub from_provider: String,
    /// `None` when there was nothing left to fail over to
    pub to_provider: Option<String>,
    pub reason: String,
    pub request_id: Uuid,
    pub success: bool,
    pub at: DateTime<Utc>,
}

struct ProviderSlot {
    config: ProviderConfig,
    client: Arc<dyn ModelProviderClient>,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<Arc<Semaphore>>,
}

impl ProviderSlot {
    fn id(&self) -> &str {
        &self.config.provider_id
    }
}

type Snapshot = Arc<Vec<Arc<ProviderSlot>>>;

pub struct ModelProviderPool {
    config: PoolConfig,
    providers: RwLock<Snapshot>,
    /// Smooth weighted round-robin counters keyed by provider id
    wrr: Mutex<HashMap<String, i64>>,
    cache: SingleFlightCache,
    failover_log: Mutex<VecDeque<FailoverEvent>>,
}

impl ModelProviderPool {
    pub fn new(config: PoolConfig) -> Self {
        let ttl = Duration::from_millis(config.fingerprint_ttl_ms);
        Self {
            config,
            providers: RwLock::new(Arc::new(Vec::new())),
            wrr: Mutex::new(HashMap::new()),
            cache: SingleFlightCache::new(ttl),
            failover_log: Mutex::new(VecDeque::new()),
        }
    }

    /// Build a pool from configuration, creating one client per provider
    pub fn from_configs(config: PoolConfig, providers: Vec<ProviderConfig>) -> ModelResult<Self> {
        let pool = Self::new(config);
        pool.reload(providers)?;
        Ok(pool)
    }

    /// Build a pool from ready-made clients
    pub fn with_clients(
        config: PoolConfig,
        providers: Vec<(ProviderConfig, Arc<dyn ModelProviderClient>)>,
    ) -> Self {
        let pool = Self::new(config);
        pool.install(providers);
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn snapshot(&self) -> Snapshot {
        self.providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.id().to_string()).collect()
    }

    /// Replace the provider set from configuration
    ///
    /// Providers whose id survives the reload keep their breaker state and,
    /// when their config is unchanged, their client.
    pub fn reload(&self, providers: Vec<ProviderConfig>) -> ModelResult<()> {
        let current = self.snapshot();
        let timeout = Duration::from_millis(self.config.request_timeout_ms);

        let mut entries = Vec::with_capacity(providers.len());
        for config in providers {
            let existing = current.iter().find(|s| s.id() == config.provider_id);
            let client = match existing {
                Some(slot) if slot.config == config => slot.client.clone(),
                _ => build_client(&config, timeout)?,
            };
            entries.push((config, client));
        }
        self.install(entries);
        Ok(())
    }

    /// Replace the provider set with ready-made clients
    pub fn reload_with_clients(&self, providers: Vec<(ProviderConfig, Arc<dyn ModelProviderClient>)>) {
        self.install(providers);
    }

    fn install(&self, providers: Vec<(ProviderConfig, Arc<dyn ModelProviderClient>)>) {
        let current = self.snapshot();
        let slots: Vec<Arc<ProviderSlot>> = providers
            .into_iter()
            .map(|(config, client)| {
                let breaker = match current.iter().find(|s| s.id() == config.provider_id) {
                    Some(slot) => {
                        slot.breaker.update_config(config.breaker.clone());
                        slot.breaker.clone()
                    }
                    None => Arc::new(CircuitBreaker::new(
                        config.provider_id.clone(),
                        config.breaker.clone(),
                    )),
                };
                let limiter = config.rate_limit.map(|n| Arc::new(Semaphore::new(n.max(1))));
                Arc::new(ProviderSlot {
                    config,
                    client,
                    breaker,
                    limiter,
                })
            })
            .collect();

        let ids: Vec<String> = slots.iter().map(|s| s.id().to_string()).collect();
        info!(providers = ?ids, "Model provider set installed");

        *self
            .providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(slots);
        self.wrr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|id, _| ids.contains(id));
    }

    /// Pick one CLOSED provider by smooth weighted round-robin
    fn next_weighted(&self, candidates: &[Arc<ProviderSlot>]) -> usize {
        let mut current = self.wrr.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let total: i64 = candidates.iter().map(|s| s.config.weight as i64).sum();

        let mut best = 0;
        let mut best_value = i64::MIN;
        for (i, slot) in candidates.iter().enumerate() {
            let value = current.entry(slot.id().to_string()).or_insert(0);
            *value += slot.config.weight as i64;
            if *value > best_value {
                best_value = *value;
                best = i;
            }
        }
        if let Some(value) = current.get_mut(candidates[best].id()) {
            *value -= total;
        }
        best
    }

    fn rank(&self, request: &ModelRequest) -> Vec<Arc<ProviderSlot>> {
        let snapshot = self.snapshot();
        let mut probes = Vec::new();
        let mut closed = Vec::new();
        for slot in snapshot.iter() {
            match slot.breaker.state() {
                CircuitState::Closed => closed.push(slot.clone()),
                _ if slot.breaker.is_probe_eligible() => probes.push(slot.clone()),
                _ => {}
            }
        }

        let mut ranking = probes;
        if !closed.is_empty() {
            let first = self.next_weighted(&closed);
            let chosen = closed.remove(first);
            closed.sort_by(|a, b| b.config.weight.cmp(&a.config.weight));
            ranking.push(chosen);
            ranking.extend(closed);
        }

        if let Some(preferred) = &request.provider_id {
            if let Some(pos) = ranking.iter().position(|s| s.id() == preferred) {
                let slot = ranking.remove(pos);
                ranking.insert(0, slot);
            }
        }
        ranking
    }

    /// Route a request to a healthy provider
    ///
    /// Identical concurrent requests share one underlying call.
    pub async fn call(&self, request: ModelRequest) -> ModelResult<ModelResponse> {
        let request_id = request.request_id;
        let key = fingerprint(&request);
        self.cache
            .get_or_call(key, || self.dispatch(request))
            .await
            .map(|mut response| {
                response.request_id = request_id;
                response
            })
    }

    async fn dispatch(&self, request: ModelRequest) -> ModelResult<ModelResponse> {
        let started = Instant::now();
        let ranking = self.rank(&request);
        if ranking.is_empty() {
            warn!(request_id = %request.request_id, "No model provider admissible, all circuits open");
            return Err(ModelProviderError::Unavailable {
                attempts: 0,
                message: "all providers are open".to_string(),
            });
        }

        let mut attempts = 0u32;
        let mut last_error: Option<ModelProviderError> = None;
        let mut pending_failover: Option<(String, String)> = None;

        for slot in &ranking {
            let outcome = self.try_provider(slot, &request, &mut attempts).await;

            if let Some((from, reason)) = pending_failover.take() {
                self.record_failover(FailoverEvent {
                    from_provider: from,
                    to_provider: Some(slot.id().to_string()),
                    reason,
                    request_id: request.request_id,
                    success: outcome.is_ok(),
                    at: Utc::now(),
                });
            }

            match outcome {
                Ok(reply) => {
                    return Ok(ModelResponse {
                        request_id: request.request_id,
                        provider_id: slot.id().to_string(),
                        model_name: reply.model_name,
                        content: reply.content,
                        latency_ms: started.elapsed().as_millis() as u64,
                        attempts,
                        prompt_tokens: reply.prompt_tokens,
                        completion_tokens: reply.completion_tokens,
                        error: last_error.map(|e| e.to_string()),
                    });
                }
                Err(e) if e.is_fatal_for_request() => {
                    warn!(provider_id = %slot.id(), error = %e, "Request rejected, not failing over");
                    return Err(e);
                }
                Err(e) => {
                    debug!(provider_id = %slot.id(), error = %e, "Provider exhausted, failing over");
                    pending_failover = Some((slot.id().to_string(), e.to_string()));
                    last_error = Some(e);
                }
            }
        }

        if let Some((from, reason)) = pending_failover {
            self.record_failover(FailoverEvent {
                from_provider: from,
                to_provider: None,
                reason,
                request_id: request.request_id,
                success: false,
                at: Utc::now(),
            });
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "all providers are open".to_string());
        warn!(request_id = %request.request_id, attempts, "Model provider pool exhausted: {}", message);
        Err(ModelProviderError::Unavailable { attempts, message })
    }

    /// Attempt one provider with same-provider retries for transient errors
    async fn try_provider(
        &self,
        slot: &ProviderSlot,
        request: &ModelRequest,
        attempts: &mut u32,
    ) -> ModelResult<ProviderReply> {
        let request_timeout = Duration::from_millis(self.config.request_timeout_ms);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            let admission = slot.breaker.try_acquire();
            if admission == Admission::Rejected {
                return Err(last_error.unwrap_or_else(|| ModelProviderError::Unavailable {
                    attempts: 0,
                    message: format!("circuit for '{}' is open", slot.id()),
                }));
            }
            let mut guard = ProbeGuard::new(&slot.breaker, admission);

            let _permit = match &slot.limiter {
                Some(limiter) => Some(
                    limiter
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| ModelProviderError::Internal(e.to_string()))?,
                ),
                None => None,
            };

            *attempts += 1;
            let outcome = match timeout(request_timeout, slot.client.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(ModelProviderError::Timeout(format!(
                    "no reply within {}ms",
                    request_timeout.as_millis()
                ))),
            };
            guard.disarm();

            match outcome {
                Ok(reply) => {
                    slot.breaker.record_success();
                    return Ok(reply);
                }
                Err(e) => {
                    slot.breaker.record_failure(&e);
                    warn!(
                        provider_id = %slot.id(),
                        request_id = %request.request_id,
                        attempt,
                        error = %e,
                        "Provider attempt failed"
                    );
                    if !e.is_transient() || attempt == self.config.max_retries {
                        return Err(e);
                    }
                    last_error = Some(e);
                    tokio::time::sleep(backoff_delay(self.config.retry_base_delay_ms, attempt)).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ModelProviderError::Internal(format!("no attempt made against '{}'", slot.id()))
        }))
    }

    fn record_failover(&self, event: FailoverEvent) {
        info!(
            from = %event.from_provider,
            to = ?event.to_provider,
            success = event.success,
            "Failover: {}",
            event.reason
        );
        let mut log = self
            .failover_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        log.push_back(event);
        while log.len() > self.config.failover_log_capacity.max(1) {
            log.pop_front();
        }
    }

    /// Most recent failover events, oldest first
    pub fn failover_events(&self, limit: usize) -> Vec<FailoverEvent> {
        let log = self
            .failover_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let skip = log.len().saturating_sub(limit);
        log.iter().skip(skip).cloned().collect()
    }

    /// Breaker snapshots without probing
    pub fn health(&self) -> Vec<ProviderHealth> {
        self.snapshot().iter().map(|s| s.breaker.health()).collect()
    }

    /// Actively probe every provider
    ///
    /// At most `health_check_concurrency` probes run at once, each bounded
    /// by `health_check_timeout_ms`. A provider still cooling down is not
    /// probed; an OPEN provider past its cooldown uses its single HALF_OPEN
    /// probe here.
    pub async fn health_check(&self) -> Vec<ProviderHealth> {
        let snapshot = self.snapshot();
        let limiter = Arc::new(Semaphore::new(self.config.health_check_concurrency.max(1)));
        let probe_timeout = Duration::from_millis(self.config.health_check_timeout_ms);

        let probes = snapshot.iter().map(|slot| {
            let limiter = limiter.clone();
            async move {
                let _permit = limiter.acquire().await.ok();
                let admission = slot.breaker.try_acquire();
                if admission == Admission::Rejected {
                    return slot.breaker.health();
                }
                let mut guard = ProbeGuard::new(&slot.breaker, admission);

                let mut request = ModelRequest::new("ping");
                request.max_tokens = 1;
                let outcome = match timeout(probe_timeout, slot.client.complete(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ModelProviderError::Timeout("health check timed out".to_string())),
                };
                guard.disarm();

                match outcome {
                    Ok(_) => slot.breaker.record_success(),
                    Err(e) => slot.breaker.record_failure(&e),
                }
                slot.breaker.health()
            }
        });

        futures::future::join_all(probes).await
    }
}

/// Exponential backoff with up to 25% jitter
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let delay = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = if delay >= 4 {
        rand::thread_rng().gen_range(0..=delay / 4)
    } else {
        0
    };
    Duration::from_millis(delay + jitter)
}
