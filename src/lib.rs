#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # emu-relay
//!
//! Messaging core for a remote-driven emulator rig. A command sender, an
//! emulator driver and a telemetry aggregator talk through two broker queues;
//! this crate is the part of each service that deals with the broker.
//!
//! ## Overview
//!
//! The services must keep running when the broker is down. The queue client
//! therefore never fails a host on broker trouble: operations return `false`,
//! the client enters degraded mode and reconnects on its own.
//!
//! ## Module Organization
//!
//! - [`resilience`] - Circuit breaker guarding broker connection attempts
//! - [`messaging`] - Broker seam, RabbitMQ and in-memory providers, resilient client
//! - [`health`] - Named health checks with a background poll loop
//! - [`config`] - Layered configuration (defaults, file, environment)
//! - [`logging`] - Structured logging setup and helpers
//! - [`error`] - Top-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use emu_relay::{init_structured_logging, RelayConfig, ResilientQueueClient};
//! use std::time::Duration;
//!
//! # async fn example() -> emu_relay::Result<()> {
//! let config = RelayConfig::from_env()?;
//! let _logging = init_structured_logging(&config.logging)?;
//!
//! let mut client = ResilientQueueClient::rabbitmq(&config);
//! client.connect(config.broker.connection_attempts).await;
//! client.declare_queue(&config.queues.commands, config.queues.durable).await?;
//!
//! client
//!     .consume(&config.queues.commands, |command| {
//!         println!("received {command}");
//!         Ok(())
//!     })
//!     .await?;
//!
//! loop {
//!     client.process_pending(Duration::from_millis(100)).await;
//! }
//! # }
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod messaging;
pub mod resilience;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use logging::{init_structured_logging, LoggingGuard};
pub use messaging::{ClientHealthSnapshot, ClientStatus, MessagingError, ResilientQueueClient};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
