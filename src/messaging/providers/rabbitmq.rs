//! # RabbitMQ Broker
//!
//! AMQP 0.9.1 implementation of the broker traits using the `lapin` crate.
//!
//! - Queues are declared on the default exchange, routing key = queue name
//! - Publishes are persistent (`delivery_mode = 2`) and wait for publisher confirms
//! - Consumers on a channel are merged into one stream and pulled through
//!   [`BrokerChannel::next_delivery`]

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SelectAll, Stream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::messaging::broker::{BrokerChannel, BrokerConnection, BrokerConnector, Delivery};
use crate::messaging::{MessagingError, MessagingResult};

const CLOSE_REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections from [`BrokerConfig`]
#[derive(Debug, Clone, Default)]
pub struct RabbitMqConnector;

impl RabbitMqConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    async fn connect(&self, settings: &BrokerConfig) -> MessagingResult<Box<dyn BrokerConnection>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(settings.connection_name.clone().into());

        let connection = tokio::time::timeout(
            settings.socket_timeout(),
            Connection::connect(&settings.amqp_uri(), properties),
        )
        .await
        .map_err(|_| MessagingError::timeout("connect", settings.socket_timeout()))?
        .map_err(|e| {
            MessagingError::connection(format!(
                "RabbitMQ connection to {} failed: {e}",
                settings.redacted_uri()
            ))
        })?;

        info!(uri = %settings.redacted_uri(), "RabbitMQ connection established");
        Ok(Box::new(RabbitMqConnection { connection }))
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}

struct RabbitMqConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn open_channel(&mut self) -> MessagingResult<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await.map_err(|e| {
            MessagingError::connection(format!("RabbitMQ channel creation failed: {e}"))
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(MessagingError::from)?;

        Ok(Box::new(RabbitMqChannel {
            channel,
            consumers: SelectAll::new(),
        }))
    }

    async fn close(&mut self) -> MessagingResult<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(CLOSE_REPLY_SUCCESS, "client closing")
            .await
            .map_err(MessagingError::from)
    }
}

type DeliveryStream =
    Pin<Box<dyn Stream<Item = (String, lapin::Result<lapin::message::Delivery>)> + Send>>;

struct RabbitMqChannel {
    channel: Channel,
    consumers: SelectAll<DeliveryStream>,
}

impl RabbitMqChannel {
    fn convert(queue_name: String, delivery: lapin::message::Delivery) -> Delivery {
        Delivery {
            queue_name,
            delivery_tag: delivery.delivery_tag,
            body: delivery.data,
            redelivered: delivery.redelivered,
        }
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn set_prefetch(&mut self, count: u16) -> MessagingResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::configuration("rabbitmq", format!("Failed to set QoS: {e}")))
    }

    async fn declare_queue(&mut self, queue_name: &str, durable: bool) -> MessagingResult<()> {
        self.channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::queue_declare(queue_name, e.to_string()))
    }

    async fn publish(&mut self, queue_name: &str, body: &[u8], persistent: bool) -> MessagingResult<()> {
        let properties = if persistent {
            BasicProperties::default().with_delivery_mode(2)
        } else {
            BasicProperties::default()
        };

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue_name,
                BasicPublishOptions::default(),
                body,
                properties.with_content_type("text/plain".into()),
            )
            .await
            .map_err(|e| MessagingError::publish(queue_name, e.to_string()))?;

        let confirmation = confirm.await.map_err(|e| {
            MessagingError::publish(queue_name, format!("Publish confirmation failed: {e}"))
        })?;

        if confirmation.is_nack() {
            return Err(MessagingError::publish(queue_name, "broker nacked the message"));
        }
        Ok(())
    }

    async fn subscribe(&mut self, queue_name: &str) -> MessagingResult<()> {
        let consumer = self
            .channel
            .basic_consume(
                queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::consume(queue_name, e.to_string()))?;

        debug!(queue = queue_name, tag = consumer.tag().as_str(), "Consumer registered");

        let name = queue_name.to_string();
        self.consumers
            .push(Box::pin(consumer.map(move |delivery| (name.clone(), delivery))));
        Ok(())
    }

    async fn next_delivery(&mut self, wait: Duration) -> MessagingResult<Option<Delivery>> {
        if self.consumers.is_empty() {
            tokio::time::sleep(wait).await;
            return Ok(None);
        }

        let ready = if wait.is_zero() {
            futures::FutureExt::now_or_never(self.consumers.next())
        } else {
            tokio::time::timeout(wait, self.consumers.next()).await.ok()
        };
        let Some(next) = ready else {
            return Ok(None);
        };

        match next {
            Some((queue_name, Ok(delivery))) => Ok(Some(Self::convert(queue_name, delivery))),
            Some((queue_name, Err(e))) => Err(MessagingError::consume(queue_name, e.to_string())),
            None => Err(MessagingError::channel_closed("all consumers were cancelled")),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> MessagingResult<()> {
        self.channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::ack(&delivery.queue_name, delivery.delivery_tag, e.to_string()))
    }

    async fn close(&mut self) -> MessagingResult<()> {
        self.consumers.clear();
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(CLOSE_REPLY_SUCCESS, "client closing")
            .await
            .map_err(MessagingError::from)
    }
}

#[cfg(test)]
mod tests {
    //! Live broker tests; run with `cargo test -- --ignored` against a local RabbitMQ

    use super::*;

    async fn live_channel() -> (Box<dyn BrokerConnection>, Box<dyn BrokerChannel>) {
        let mut connection = RabbitMqConnector::new()
            .connect(&BrokerConfig::default())
            .await
            .expect("RabbitMQ must be running on 127.0.0.1:5672");
        let channel = connection.open_channel().await.unwrap();
        (connection, channel)
    }

    #[tokio::test]
    #[ignore = "requires a running RabbitMQ broker"]
    async fn test_publish_consume_ack_roundtrip() {
        let (mut connection, mut channel) = live_channel().await;
        let queue = format!("emu_relay_test_{}", uuid::Uuid::new_v4().simple());

        channel.declare_queue(&queue, false).await.unwrap();
        channel.set_prefetch(1).await.unwrap();
        channel.publish(&queue, b"START", true).await.unwrap();
        channel.subscribe(&queue).await.unwrap();

        let delivery = channel
            .next_delivery(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("message should arrive");
        assert_eq!(delivery.text(), "START");
        channel.ack(&delivery).await.unwrap();

        channel.close().await.unwrap();
        connection.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running RabbitMQ broker"]
    async fn test_idle_channel_returns_none() {
        let (mut connection, mut channel) = live_channel().await;
        assert!(channel
            .next_delivery(Duration::from_millis(100))
            .await
            .unwrap()
            .is_none());
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let settings = BrokerConfig {
            port: 1,
            socket_timeout_seconds: 2,
            ..BrokerConfig::default()
        };
        let err = match RabbitMqConnector::new().connect(&settings).await {
            Ok(_) => panic!("nothing listens on port 1"),
            Err(err) => err,
        };
        assert!(err.is_transient());
    }
}
