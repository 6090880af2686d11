//! # Broker Traits
//!
//! Provider-agnostic connection seam used by the resilient client. A
//! [`BrokerConnector`] opens [`BrokerConnection`]s; a connection opens
//! [`BrokerChannel`]s, which carry every queue operation.
//!
//! Implementations:
//! - `RabbitMqConnector` (AMQP 0.9.1 via `lapin`, feature `rabbitmq`)
//! - `InMemoryBroker` (tests and local development)

use std::time::Duration;

use async_trait::async_trait;

use crate::config::BrokerConfig;
use crate::messaging::MessagingResult;

/// A message handed to a consumer, still awaiting acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue the message was consumed from
    pub queue_name: String,
    /// Channel-scoped tag used for acknowledgement
    pub delivery_tag: u64,
    /// Raw message body
    pub body: Vec<u8>,
    /// Broker already delivered this message once before
    pub redelivered: bool,
}

impl Delivery {
    /// Body decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Opens connections to a broker
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Open a new connection using the given settings
    async fn connect(&self, settings: &BrokerConfig) -> MessagingResult<Box<dyn BrokerConnection>>;

    /// Provider name for logging (e.g. "rabbitmq", "in_memory")
    fn provider_name(&self) -> &'static str;
}

/// A live broker connection
#[async_trait]
pub trait BrokerConnection: Send {
    /// Whether the connection is still usable
    fn is_open(&self) -> bool;

    /// Open a channel on this connection
    async fn open_channel(&mut self) -> MessagingResult<Box<dyn BrokerChannel>>;

    /// Close the connection; closing twice is not an error
    async fn close(&mut self) -> MessagingResult<()>;
}

/// A channel on a broker connection
#[async_trait]
pub trait BrokerChannel: Send {
    /// Whether the channel is still usable
    fn is_open(&self) -> bool;

    /// Limit unacknowledged deliveries in flight to this channel's consumers
    async fn set_prefetch(&mut self, count: u16) -> MessagingResult<()>;

    /// Declare a queue (idempotent)
    async fn declare_queue(&mut self, queue_name: &str, durable: bool) -> MessagingResult<()>;

    /// Publish to a queue through the default exchange
    async fn publish(&mut self, queue_name: &str, body: &[u8], persistent: bool)
        -> MessagingResult<()>;

    /// Start consuming a queue; deliveries surface through `next_delivery`
    async fn subscribe(&mut self, queue_name: &str) -> MessagingResult<()>;

    /// Wait up to `wait` for the next delivery. `Duration::ZERO` only returns
    /// what is already available.
    async fn next_delivery(&mut self, wait: Duration) -> MessagingResult<Option<Delivery>>;

    /// Acknowledge a delivery
    async fn ack(&mut self, delivery: &Delivery) -> MessagingResult<()>;

    /// Close the channel; closing twice is not an error
    async fn close(&mut self) -> MessagingResult<()>;
}
