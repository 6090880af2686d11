//! # Broker Providers
//!
//! Concrete implementations of the broker traits.
//!
//! - [`RabbitMqConnector`] - RabbitMQ via the lapin crate (feature `rabbitmq`)
//! - [`InMemoryBroker`] - shared in-memory queues with fault injection for testing

mod in_memory;
#[cfg(feature = "rabbitmq")]
mod rabbitmq;

pub use in_memory::InMemoryBroker;
#[cfg(feature = "rabbitmq")]
pub use rabbitmq::RabbitMqConnector;
