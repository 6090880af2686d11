//! # Health Monitoring
//!
//! Named health predicates aggregated into a service-level status, with an
//! optional background loop that re-evaluates them on an interval.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use emu_relay::health::{queue_connectivity_check, HealthMonitor};
//! use emu_relay::messaging::{InMemoryBroker, ResilientQueueClient};
//! use emu_relay::RelayConfig;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let config = RelayConfig::default();
//! let client = ResilientQueueClient::new(&config, Arc::new(InMemoryBroker::new()));
//!
//! let monitor = HealthMonitor::from_config("game-loop", &config.health);
//! monitor.register_check("broker", queue_connectivity_check(client.status()));
//! monitor.start();
//! // ...
//! monitor.stop().await;
//! # }
//! ```

mod checks;
mod monitor;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use checks::{circuit_breaker_check, queue_connectivity_check};
pub use monitor::{CheckReport, HealthMonitor, HealthReport};

/// Health of a single check or of the whole service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// At least half of the checks pass
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Overall status from individual results: healthy when all pass,
    /// degraded when at least half pass, unhealthy otherwise. No checks is
    /// healthy.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        let (healthy, total) = statuses
            .into_iter()
            .fold((0usize, 0usize), |(healthy, total), status| {
                (healthy + usize::from(status.is_healthy()), total + 1)
            });

        if healthy == total {
            HealthStatus::Healthy
        } else if healthy * 2 >= total {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HealthStatus::*;

    #[test]
    fn test_aggregate() {
        assert_eq!(HealthStatus::aggregate([]), Healthy);
        assert_eq!(HealthStatus::aggregate([Healthy, Healthy]), Healthy);
        assert_eq!(HealthStatus::aggregate([Healthy, Unhealthy]), Degraded);
        assert_eq!(HealthStatus::aggregate([Healthy, Healthy, Unhealthy]), Degraded);
        assert_eq!(HealthStatus::aggregate([Healthy, Unhealthy, Unhealthy]), Unhealthy);
        assert_eq!(HealthStatus::aggregate([Unhealthy]), Unhealthy);
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(Degraded.to_string(), "degraded");
        assert_eq!(serde_json::to_string(&Unhealthy).unwrap(), "\"unhealthy\"");
    }
}
