//! # Circuit Breaker Configuration
//!
//! Configuration structure and validation for a single circuit breaker.
//! Host-level settings live in `crate::config::CircuitBreakerSettings` and are
//! converted into this struct.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of counted failures before opening the circuit
    pub failure_threshold: u32,

    /// Time to stay open after the last failure before a trial call is admitted
    pub recovery_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Configuration used for broker connection attempts
    pub fn for_broker() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.recovery_timeout.is_zero() {
            return Err("recovery_timeout must be greater than 0".to_string());
        }

        if self.recovery_timeout > Duration::from_secs(3600) {
            return Err("recovery_timeout should not exceed 3600 seconds".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::for_broker()
    }
}
