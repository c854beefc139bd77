//! Circuit breaker for handler calls
//!
//! One breaker per registered handler, shared by every node bound to it.
//!
//! ```text
//! CLOSED --(failure_threshold consecutive failures)--> OPEN
//! OPEN   --(recovery_timeout elapsed, next call)-----> HALF_OPEN
//! HALF_OPEN --(trial success)--> CLOSED
//! HALF_OPEN --(trial failure)--> OPEN
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::error::HostError;
use crate::telemetry::{HostEvent, Telemetry};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Counters exposed through the health report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub state: Option<CircuitState>,
    pub consecutive_failures: u32,
    pub admitted_calls: u64,
    pub rejected_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    metrics: BreakerMetrics,
}

/// Per-handler circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    handler_type: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    telemetry: Option<Telemetry>,
}

impl CircuitBreaker {
    pub fn new(handler_type: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            handler_type: handler_type.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_admitted: 0,
                metrics: BreakerMetrics::default(),
            }),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask permission to call the handler
    ///
    /// Rejections never reach the handler. An OPEN breaker whose recovery
    /// timeout has elapsed moves to HALF_OPEN here and admits up to
    /// `half_open_max_calls` trials.
    pub fn try_acquire(&self) -> Result<(), HostError> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let recovered = inner
                .opened_at
                .is_some_and(|t| t.elapsed() >= self.config.recovery_timeout());
            if recovered {
                inner.half_open_admitted = 0;
                self.transition(&mut inner, CircuitState::HalfOpen);
            }
        }

        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_max_calls {
                    inner.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
        };

        if admitted {
            inner.metrics.admitted_calls += 1;
            Ok(())
        } else {
            inner.metrics.rejected_calls += 1;
            Err(HostError::CircuitOpen {
                handler_type: self.handler_type.clone(),
            })
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.metrics.successes += 1;
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.opened_at = None;
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.metrics.failures += 1;
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::HalfOpen => self.trip(&mut inner),
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                self.trip(&mut inner)
            }
            _ => {}
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock();
        let mut metrics = inner.metrics.clone();
        metrics.state = Some(inner.state);
        metrics.consecutive_failures = inner.consecutive_failures;
        metrics
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.opened_at = Some(Instant::now());
        inner.metrics.times_opened += 1;
        self.transition(inner, CircuitState::Open);
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Open => tracing::warn!(
                handler_type = %self.handler_type,
                %from,
                consecutive_failures = inner.consecutive_failures,
                "circuit opened"
            ),
            _ => tracing::info!(handler_type = %self.handler_type, %from, %to, "circuit transition"),
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.emit(HostEvent::BreakerTransition {
                handler_type: self.handler_type.clone(),
                from,
                to,
            });
        }
    }
}
