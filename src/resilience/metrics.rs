//! # Circuit Breaker Metrics
//!
//! Point-in-time counters for a circuit breaker, suitable for logging and for
//! operational tooling that serialises health snapshots.

use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};

/// Metrics snapshot for a single circuit breaker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls that reached the guarded operation
    pub total_calls: u64,

    /// Number of successful calls
    pub success_count: u64,

    /// Number of failed calls (counted and uncounted)
    pub failure_count: u64,

    /// Calls rejected without invoking the operation
    pub rejected_count: u64,

    /// Current failure counter used for the open decision
    pub consecutive_failures: u32,

    /// Circuit state when the snapshot was taken
    pub current_state: CircuitState,
}

impl CircuitBreakerMetrics {
    /// Fraction of attempted calls that failed (0.0 when nothing ran yet)
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.failure_count as f64 / self.total_calls as f64
    }

    /// Get human-readable state description
    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Testing broker health",
        }
    }

    /// Format metrics for logging
    pub fn format_summary(&self) -> String {
        format!(
            "State: {} | Calls: {} | Failures: {} ({:.1}%) | Rejected: {}",
            self.state_description(),
            self.total_calls,
            self.failure_count,
            self.failure_rate() * 100.0,
            self.rejected_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(total: u64, failures: u64, state: CircuitState) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: total,
            success_count: total - failures,
            failure_count: failures,
            rejected_count: 2,
            consecutive_failures: failures as u32,
            current_state: state,
        }
    }

    #[test]
    fn test_failure_rate() {
        assert_eq!(snapshot(0, 0, CircuitState::Closed).failure_rate(), 0.0);
        assert_eq!(snapshot(4, 1, CircuitState::Closed).failure_rate(), 0.25);
    }

    #[test]
    fn test_format_summary() {
        let summary = snapshot(10, 5, CircuitState::Open).format_summary();
        assert!(summary.contains("Failing"));
        assert!(summary.contains("Calls: 10"));
        assert!(summary.contains("50.0%"));
        assert!(summary.contains("Rejected: 2"));
    }
}
