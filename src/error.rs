//! # Crate Error Types
//!
//! Top-level error for host services wiring the relay together. Component
//! modules keep their own focused error enums (`MessagingError`,
//! `CircuitBreakerError`) and convert into [`RelayError`] at the boundary.

use crate::messaging::MessagingError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

impl RelayError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a logging error
    pub fn logging(message: impl Into<String>) -> Self {
        Self::Logging(message.into())
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
