//! Shared view of a client's connection state.
//!
//! The client owns its broker handles, but health checks run on another task.
//! [`ClientStatus`] is the part of the client they can read without locking it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::messaging::MessagingError;
use crate::resilience::{CircuitBreaker, CircuitState};

/// Point-in-time connection health of a [`ResilientQueueClient`](crate::messaging::ResilientQueueClient)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHealthSnapshot {
    pub connected: bool,
    pub degraded: bool,
    pub circuit_state: CircuitState,
    /// Consecutive failures counted by the circuit breaker
    pub failure_count: u32,
    /// Failed connection attempts since the last successful connect
    pub connection_failures: u64,
}

#[derive(Debug)]
pub struct ClientStatus {
    connected: AtomicBool,
    degraded: AtomicBool,
    connection_failures: AtomicU64,
    breaker: Arc<CircuitBreaker<MessagingError>>,
}

impl ClientStatus {
    /// A client starts disconnected and degraded
    pub fn new(breaker: Arc<CircuitBreaker<MessagingError>>) -> Self {
        Self {
            connected: AtomicBool::new(false),
            degraded: AtomicBool::new(true),
            connection_failures: AtomicU64::new(0),
            breaker,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn connection_failures(&self) -> u64 {
        self.connection_failures.load(Ordering::Relaxed)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker<MessagingError>> {
        &self.breaker
    }

    pub fn snapshot(&self) -> ClientHealthSnapshot {
        ClientHealthSnapshot {
            connected: self.is_connected(),
            degraded: self.is_degraded(),
            circuit_state: self.breaker.state(),
            failure_count: self.breaker.failure_count(),
            connection_failures: self.connection_failures(),
        }
    }

    pub(crate) fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
        self.degraded.store(false, Ordering::Release);
        self.connection_failures.store(0, Ordering::Relaxed);
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.degraded.store(true, Ordering::Release);
    }

    pub(crate) fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }
}
