//! # Relay Configuration
//!
//! Layered configuration for the relay services. Sources, lowest precedence first:
//!
//! 1. Built-in defaults ([`RelayConfig::default`])
//! 2. An optional configuration file (TOML, YAML or JSON, picked by extension)
//! 3. `RELAY__SECTION__KEY` environment variables (e.g. `RELAY__BROKER__PORT=5673`)
//! 4. The short legacy variables `RABBITMQ_HOST`, `QUEUE_COMMANDS`,
//!    `QUEUE_EVENTS` and `RELAY_LOG_LEVEL`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use emu_relay::config::RelayConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::from_env()?;
//! println!("broker at {}", config.broker.redacted_uri());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::messaging::backoff::{ReconnectPolicy, RetryPolicy};
use crate::messaging::validate_queue_name;
use crate::resilience::CircuitBreakerConfig;

/// Root configuration for a relay service process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Name reported by health snapshots and log lines
    pub service_name: String,

    /// Broker connection parameters
    pub broker: BrokerConfig,

    /// Logical queues shared by the services
    pub queues: QueueConfig,

    /// Connect retry and auto-reconnect schedule
    pub reconnect: ReconnectConfig,

    /// Circuit breaker guarding connection attempts
    pub circuit_breaker: CircuitBreakerSettings,

    /// Background health polling
    pub health: HealthConfig,

    /// Log level and optional file output
    pub logging: LoggingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            service_name: "emu-relay".to_string(),
            broker: BrokerConfig::default(),
            queues: QueueConfig::default(),
            reconnect: ReconnectConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// AMQP connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    /// Attempts made by a host's initial `connect`
    pub connection_attempts: u32,
    /// Upper bound for establishing the TCP/AMQP connection
    pub socket_timeout_seconds: u64,
    pub heartbeat_seconds: u16,
    /// Longest a publish may wait on a connection the broker has blocked
    pub blocked_connection_timeout_seconds: u64,
    /// Upper bound for a single publish so the foreground loop keeps moving
    pub publish_timeout_seconds: u64,
    /// Unacknowledged deliveries per consumer channel. Must be 1: per-queue
    /// ordering and backpressure rely on one message in flight.
    pub prefetch_count: u16,
    pub connection_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            connection_attempts: 3,
            socket_timeout_seconds: 10,
            heartbeat_seconds: 60,
            blocked_connection_timeout_seconds: 300,
            publish_timeout_seconds: 10,
            prefetch_count: 1,
            connection_name: "emu-relay".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_seconds)
    }

    pub fn blocked_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.blocked_connection_timeout_seconds)
    }

    /// Effective publish bound: the shorter of the publish and blocked-connection timeouts
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_seconds).min(self.blocked_connection_timeout())
    }

    /// AMQP URI including credentials, heartbeat and connect timeout
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
            self.username,
            self.password,
            self.host,
            self.port,
            encode_vhost(&self.virtual_host),
            self.heartbeat_seconds,
            self.socket_timeout().as_millis()
        )
    }

    /// AMQP URI safe for log output
    pub fn redacted_uri(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            self.username,
            self.host,
            self.port,
            encode_vhost(&self.virtual_host)
        )
    }
}

fn encode_vhost(vhost: &str) -> String {
    vhost.replace('%', "%25").replace('/', "%2F")
}

/// Queue names used by the command sender, emulator driver and telemetry
/// aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub commands: String,
    pub events: String,
    pub durable: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            commands: "fila_comandos".to_string(),
            events: "fila_eventos".to_string(),
            durable: true,
        }
    }
}

/// Retry schedule for `connect` and throttle for auto-reconnect, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_retry_delay_ms: u64,
    pub retry_multiplier: f64,
    pub max_retry_delay_ms: u64,
    pub backoff_floor_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay_ms: 2_000,
            retry_multiplier: 2.0,
            max_retry_delay_ms: 30_000,
            backoff_floor_ms: 5_000,
            backoff_multiplier: 1.5,
            max_backoff_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_retry_delay_ms),
            multiplier: self.retry_multiplier,
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            floor: Duration::from_millis(self.backoff_floor_ms),
            multiplier: self.backoff_multiplier,
            cap: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Circuit breaker thresholds as they appear in configuration files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let preset = CircuitBreakerConfig::for_broker();
        Self {
            failure_threshold: preset.failure_threshold,
            recovery_timeout_seconds: preset.recovery_timeout.as_secs(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_seconds: u64,
    /// How long `stop` waits for the poll loop before aborting it
    pub stop_timeout_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            stop_timeout_seconds: 5,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Also write JSON logs into this directory
    pub directory: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            ansi: true,
        }
    }
}

impl RelayConfig {
    /// Load from defaults and the process environment
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from defaults, an optional file and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load with an explicit environment map instead of the process environment
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let legacy = |key: &str| -> Option<String> {
            match &env {
                Some(vars) => vars.get(key).cloned(),
                None => std::env::var(key).ok(),
            }
        };

        let mut builder = Config::builder().add_source(Config::try_from(&RelayConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder
            .add_source(
                Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true)
                    .source(env.clone()),
            )
            .set_override_option("broker.host", legacy("RABBITMQ_HOST"))?
            .set_override_option("queues.commands", legacy("QUEUE_COMMANDS"))?
            .set_override_option("queues.events", legacy("QUEUE_EVENTS"))?
            .set_override_option("logging.level", legacy("RELAY_LOG_LEVEL"))?;

        let config: RelayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the services misbehave
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(RelayError::configuration("service_name must not be empty"));
        }

        if self.broker.host.trim().is_empty() {
            return Err(RelayError::configuration("broker.host must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(RelayError::configuration("broker.port must be greater than 0"));
        }
        if self.broker.connection_attempts == 0 {
            return Err(RelayError::configuration(
                "broker.connection_attempts must be greater than 0",
            ));
        }
        if self.broker.socket_timeout_seconds == 0 {
            return Err(RelayError::configuration(
                "broker.socket_timeout_seconds must be greater than 0",
            ));
        }
        if self.broker.publish_timeout_seconds == 0 {
            return Err(RelayError::configuration(
                "broker.publish_timeout_seconds must be greater than 0",
            ));
        }
        if self.broker.prefetch_count != 1 {
            return Err(RelayError::configuration(format!(
                "broker.prefetch_count must be 1, got {}",
                self.broker.prefetch_count
            )));
        }

        validate_queue_name(&self.queues.commands)
            .map_err(|e| RelayError::configuration(format!("queues.commands: {e}")))?;
        validate_queue_name(&self.queues.events)
            .map_err(|e| RelayError::configuration(format!("queues.events: {e}")))?;
        if self.queues.commands == self.queues.events {
            return Err(RelayError::configuration(
                "queues.commands and queues.events must differ",
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_retry_delay_ms == 0 || reconnect.backoff_floor_ms == 0 {
            return Err(RelayError::configuration(
                "reconnect delays must be greater than 0",
            ));
        }
        if reconnect.retry_multiplier < 1.0 || reconnect.backoff_multiplier < 1.0 {
            return Err(RelayError::configuration(
                "reconnect multipliers must be at least 1.0",
            ));
        }
        if reconnect.initial_retry_delay_ms > reconnect.max_retry_delay_ms
            || reconnect.backoff_floor_ms > reconnect.max_backoff_ms
        {
            return Err(RelayError::configuration(
                "reconnect delays must not exceed their caps",
            ));
        }

        self.circuit_breaker
            .to_circuit_breaker_config()
            .validate()
            .map_err(|e| RelayError::configuration(format!("circuit_breaker: {e}")))?;

        if self.health.interval_seconds == 0 {
            return Err(RelayError::configuration(
                "health.interval_seconds must be greater than 0",
            ));
        }

        Ok(())
    }
}
