//! # Circuit Breaker Implementation
//!
//! Fault isolation for calls into a dependency that may be unavailable. The
//! breaker has three states: Closed (normal operation), Open (failing fast) and
//! Half-Open (a single trial call probes for recovery).
//!
//! State lives behind one synchronous mutex that is only held around
//! transitions, never while the guarded operation runs. Which errors count as
//! failures is decided by a filter supplied at construction.

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - one trial call is allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not invoked
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation ran and failed
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    /// True when the call was rejected without running the operation
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CircuitBreakerError::CircuitOpen { .. })
    }

    /// The operation's own error, if it ran
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            CircuitBreakerError::OperationFailed(err) => Some(err),
            CircuitBreakerError::CircuitOpen { .. } => None,
        }
    }
}

type FailureFilter<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Default)]
struct CallCounters {
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    rejected_count: AtomicU64,
}

/// Failure-tripped gate around a fallible async operation
pub struct CircuitBreaker<E> {
    /// Component name for logging and metrics
    name: String,

    config: CircuitBreakerConfig,

    /// Decides whether an operation error counts toward tripping
    failure_filter: FailureFilter<E>,

    inner: Mutex<BreakerState>,

    counters: CallCounters,
}

impl<E> fmt::Debug for CircuitBreaker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .finish()
    }
}

/// Half-open trial slot; released on drop unless a transition consumed it.
struct ProbeSlot<'a, E> {
    breaker: &'a CircuitBreaker<E>,
    armed: bool,
}

impl<E> Drop for ProbeSlot<'_, E> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

impl<E: 'static> CircuitBreaker<E> {
    /// Create a new circuit breaker that counts every operation error
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_secs = config.recovery_timeout.as_secs_f64(),
            "Circuit breaker initialized"
        );

        Self {
            name,
            config,
            failure_filter: Arc::new(|_: &E| true),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
            counters: CallCounters::default(),
        }
    }

    /// Only errors for which `filter` returns true trip the breaker
    pub fn with_failure_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.failure_filter = Arc::new(filter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current stored state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// True while calls would be rejected outright: open and still inside the
    /// recovery timeout
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == CircuitState::Open && !self.should_attempt_reset(&inner)
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let is_probe = self.admit()?;
        let mut slot = ProbeSlot {
            breaker: self,
            armed: is_probe,
        };

        match operation().await {
            Ok(value) => {
                slot.armed = false;
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.counters.failure_count.fetch_add(1, Ordering::Relaxed);
                if (self.failure_filter)(&err) {
                    slot.armed = false;
                    self.record_failure(is_probe);
                } else {
                    debug!(component = %self.name, "Operation error not counted by failure filter");
                }
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    /// Force the breaker closed and forget past failures
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
        inner.state = CircuitState::Closed;
        info!(component = %self.name, "Circuit breaker manually reset");
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (current_state, consecutive_failures) = {
            let inner = self.inner.lock();
            (inner.state, inner.failure_count)
        };

        CircuitBreakerMetrics {
            total_calls: self.counters.total_calls.load(Ordering::Relaxed),
            success_count: self.counters.success_count.load(Ordering::Relaxed),
            failure_count: self.counters.failure_count.load(Ordering::Relaxed),
            rejected_count: self.counters.rejected_count.load(Ordering::Relaxed),
            consecutive_failures,
            current_state,
        }
    }

    /// Decide whether a call may run. Returns whether it is the half-open probe.
    fn admit(&self) -> Result<bool, CircuitBreakerError<E>> {
        let mut inner = self.inner.lock();
        let current = inner.state;

        let is_probe = match current {
            CircuitState::Closed => false,
            CircuitState::Open if self.should_attempt_reset(&inner) => {
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                info!(component = %self.name, "Circuit breaker half-open (testing recovery)");
                true
            }
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                true
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                drop(inner);
                self.counters.rejected_count.fetch_add(1, Ordering::Relaxed);
                debug!(component = %self.name, "Call rejected, circuit open");
                return Err(CircuitBreakerError::CircuitOpen {
                    component: self.name.clone(),
                });
            }
        };

        self.counters.total_calls.fetch_add(1, Ordering::Relaxed);
        Ok(is_probe)
    }

    fn should_attempt_reset(&self, inner: &BreakerState) -> bool {
        match inner.last_failure {
            None => true,
            Some(at) => at.elapsed() >= self.config.recovery_timeout,
        }
    }

    fn record_success(&self) {
        self.counters.success_count.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(component = %self.name, "Circuit breaker closed (recovered)");
        }
        inner.failure_count = 0;
        inner.probe_in_flight = false;
        inner.state = CircuitState::Closed;
    }

    fn record_failure(&self, was_probe: bool) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        if was_probe {
            inner.probe_in_flight = false;
        }

        if inner.failure_count >= self.config.failure_threshold || was_probe {
            if inner.state != CircuitState::Open {
                inner.state = CircuitState::Open;
                warn!(
                    component = %self.name,
                    failures = inner.failure_count,
                    failure_threshold = self.config.failure_threshold,
                    recovery_timeout_secs = self.config.recovery_timeout.as_secs_f64(),
                    "Circuit breaker opened (failing fast)"
                );
            }
        } else {
            debug!(
                component = %self.name,
                failures = inner.failure_count,
                failure_threshold = self.config.failure_threshold,
                "Counted failure"
            );
        }
    }
}
