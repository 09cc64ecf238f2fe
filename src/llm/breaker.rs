//! Per-provider circuit breaker
//!
//! ```text
//! CLOSED --N consecutive failures--> OPEN --cooldown elapsed--> HALF_OPEN
//!   ^                                  ^                            |
//!   |                                  +-------probe failed---------+
//!   +---------------------probe succeeded---------------------------+
//! ```
//!
//! All transitions happen under one short-lived mutex, so concurrent calls
//! completing at the same time never interleave a read-modify-write. The
//! clock is `tokio::time::Instant`, which lets tests drive cooldowns with a
//! paused runtime.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use super::{BreakerConfig, ModelProviderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a provider's breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Outcome of asking the breaker for permission to call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single HALF_OPEN probe; its outcome decides the next state
    Probe,
    Rejected,
}

#[derive(Debug)]
struct BreakerInner {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    cooldown: Duration,
    cooldown_until: Option<Instant>,
    probe_in_flight: bool,
    last_error: Option<String>,
    total_successes: u64,
    total_failures: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider_id: String,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider_id: impl Into<String>, config: BreakerConfig) -> Self {
        let cooldown = Duration::from_millis(config.base_cooldown_ms);
        Self {
            provider_id: provider_id.into(),
            inner: Mutex::new(BreakerInner {
                config,
                state: CircuitState::Closed,
                consecutive_failures: 0,
                cooldown,
                cooldown_until: None,
                probe_in_flight: false,
                last_error: None,
                total_successes: 0,
                total_failures: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Replace thresholds on hot reload, keeping the current state
    pub fn update_config(&self, config: BreakerConfig) {
        let mut inner = self.lock();
        let max = Duration::from_millis(config.max_cooldown_ms);
        inner.cooldown = inner.cooldown.min(max);
        inner.config = config;
    }

    /// True when the breaker would hand out a probe right now
    pub fn is_probe_eligible(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open => {
                !inner.probe_in_flight
                    && inner.cooldown_until.map_or(true, |until| Instant::now() >= until)
            }
            CircuitState::HalfOpen => !inner.probe_in_flight,
            CircuitState::Closed => false,
        }
    }

    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::Open => {
                let cooled = inner.cooldown_until.map_or(true, |until| Instant::now() >= until);
                if cooled && !inner.probe_in_flight {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(provider_id = %self.provider_id, "Circuit half-open, sending probe");
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.cooldown = Duration::from_millis(inner.config.base_cooldown_ms);
                inner.cooldown_until = None;
                inner.probe_in_flight = false;
                info!(provider_id = %self.provider_id, "Circuit closed after successful probe");
            }
            // A call admitted before the circuit opened; the open decision stands
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &ModelProviderError) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.last_error = Some(error.to_string());

        if !error.counts_toward_breaker() {
            if inner.state == CircuitState::HalfOpen {
                inner.probe_in_flight = false;
            }
            return;
        }

        inner.consecutive_failures += 1;
        let max = Duration::from_millis(inner.config.max_cooldown_ms);
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= inner.config.failure_threshold {
                    inner.cooldown = Duration::from_millis(inner.config.base_cooldown_ms).min(max);
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.cooldown = (inner.cooldown * 2).min(max);
                self.open(&mut inner);
            }
        }
    }

    /// Release a probe whose call was dropped before it finished
    pub fn abandon_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.probe_in_flight = false;
        inner.cooldown_until = Some(Instant::now() + inner.cooldown);
        warn!(
            provider_id = %self.provider_id,
            consecutive_failures = inner.consecutive_failures,
            cooldown_ms = inner.cooldown.as_millis() as u64,
            "Circuit opened"
        );
    }

    pub fn health(&self) -> ProviderHealth {
        let inner = self.lock();
        let cooldown_until = inner.cooldown_until.and_then(|until| {
            let remaining = until.saturating_duration_since(Instant::now());
            chrono::Duration::from_std(remaining).ok().map(|d| Utc::now() + d)
        });

        ProviderHealth {
            provider_id: self.provider_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            cooldown_until: if inner.state == CircuitState::Closed {
                None
            } else {
                cooldown_until
            },
            last_error: inner.last_error.clone(),
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
        }
    }
}

/// Guard that releases an unresolved probe when dropped
pub(crate) struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> ProbeGuard<'a> {
    pub(crate) fn new(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        Self {
            breaker,
            armed: admission == Admission::Probe,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_probe();
        }
    }
}
