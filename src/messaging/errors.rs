//! # Messaging Error Types
//!
//! Structured error handling for the broker seam and the resilient client.
//! [`MessagingError::is_transient`] separates broker-availability failures,
//! which trip the circuit breaker and are absorbed by the client, from
//! programming errors that are returned to the caller.

use crate::resilience::CircuitBreakerError;
use thiserror::Error;

/// Maximum queue name length accepted by AMQP 0.9.1 (short string)
pub const MAX_QUEUE_NAME_BYTES: usize = 255;

/// Comprehensive messaging error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Channel closed: {message}")]
    ChannelClosed { message: String },

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Queue declare failed: {queue_name}: {message}")]
    QueueDeclare { queue_name: String, message: String },

    #[error("Publish failed: {queue_name}: {message}")]
    Publish { queue_name: String, message: String },

    #[error("Consume failed: {queue_name}: {message}")]
    Consume { queue_name: String, message: String },

    #[error("Ack failed: {queue_name}: delivery {delivery_tag}: {message}")]
    Ack {
        queue_name: String,
        delivery_tag: u64,
        message: String,
    },

    #[error("Network timeout: operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Circuit breaker is open for component: {component}")]
    CircuitBreakerOpen { component: String },

    #[error("Invalid queue name: {queue_name:?}: {reason}")]
    InvalidQueueName { queue_name: String, reason: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    /// Create a broker connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::ChannelClosed {
            message: message.into(),
        }
    }

    /// Create a queue declare error
    pub fn queue_declare(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueDeclare {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a publish error
    pub fn publish(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a consume error
    pub fn consume(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consume {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create an ack error
    pub fn ack(
        queue_name: impl Into<String>,
        delivery_tag: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::Ack {
            queue_name: queue_name.into(),
            delivery_tag,
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a circuit breaker open error
    pub fn circuit_breaker_open(component: impl Into<String>) -> Self {
        Self::CircuitBreakerOpen {
            component: component.into(),
        }
    }

    /// Create an invalid queue name error
    pub fn invalid_queue_name(queue_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueueName {
            queue_name: queue_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Broker-availability failures: worth retrying, count toward the breaker
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection { .. }
                | MessagingError::ChannelClosed { .. }
                | MessagingError::NotConnected
                | MessagingError::QueueDeclare { .. }
                | MessagingError::Publish { .. }
                | MessagingError::Consume { .. }
                | MessagingError::Ack { .. }
                | MessagingError::Timeout { .. }
        )
    }
}

/// Reject queue names the broker would refuse or that indicate a caller bug
pub fn validate_queue_name(queue_name: &str) -> MessagingResult<()> {
    if queue_name.is_empty() {
        return Err(MessagingError::invalid_queue_name(
            queue_name,
            "queue name must not be empty",
        ));
    }

    if queue_name.len() > MAX_QUEUE_NAME_BYTES {
        return Err(MessagingError::invalid_queue_name(
            queue_name,
            format!("queue name exceeds {MAX_QUEUE_NAME_BYTES} bytes"),
        ));
    }

    if queue_name.chars().any(char::is_control) {
        return Err(MessagingError::invalid_queue_name(
            queue_name,
            "queue name contains control characters",
        ));
    }

    if queue_name.starts_with("amq.") {
        return Err(MessagingError::invalid_queue_name(
            queue_name,
            "the amq. prefix is reserved by the broker",
        ));
    }

    Ok(())
}

/// Conversion from circuit breaker errors
impl From<CircuitBreakerError<MessagingError>> for MessagingError {
    fn from(err: CircuitBreakerError<MessagingError>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen { component } => {
                MessagingError::circuit_breaker_open(component)
            }
            CircuitBreakerError::OperationFailed(inner) => inner,
        }
    }
}

/// Conversion from lapin errors; anything surfacing from the AMQP layer is a
/// broker-availability problem from the client's point of view
#[cfg(feature = "rabbitmq")]
impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::ChannelsLimitReached => {
                MessagingError::channel_closed(err.to_string())
            }
            _ => MessagingError::connection(err.to_string()),
        }
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
