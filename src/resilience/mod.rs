//! # Resilience Module
//!
//! Fault isolation for calls into the message broker.
//!
//! - **Circuit Breaker**: stops hammering a failing dependency and probes it again
//!   once the recovery timeout has elapsed
//! - **Metrics**: call/failure/rejection counters for health snapshots
//! - **Configuration**: thresholds and timeouts with validation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use emu_relay::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     recovery_timeout: Duration::from_secs(30),
//! };
//!
//! let breaker = CircuitBreaker::<std::io::Error>::new("broker", config);
//!
//! let value = breaker
//!     .call(|| async { Ok::<_, std::io::Error>("connected") })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::CircuitBreakerConfig;
pub use metrics::CircuitBreakerMetrics;
