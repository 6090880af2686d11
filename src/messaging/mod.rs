//! # Messaging Module
//!
//! Broker-facing half of the relay: a provider-agnostic connection seam, the
//! RabbitMQ and in-memory providers behind it, and the resilient client the
//! services talk to.

pub mod backoff;
pub mod broker;
pub mod errors;
pub mod providers;
pub mod resilient_client;
pub mod status;

pub use backoff::{ReconnectPolicy, RetryPolicy};
pub use broker::{BrokerChannel, BrokerConnection, BrokerConnector, Delivery};
pub use errors::{validate_queue_name, MessagingError, MessagingResult, MAX_QUEUE_NAME_BYTES};
pub use providers::InMemoryBroker;
#[cfg(feature = "rabbitmq")]
pub use providers::RabbitMqConnector;
pub use resilient_client::{MessageCallback, ResilientQueueClient};
pub use status::{ClientHealthSnapshot, ClientStatus};
