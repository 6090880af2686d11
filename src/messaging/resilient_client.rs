//! # Resilient Queue Client
//!
//! Broker client that keeps its host running while the broker is away. Every
//! operation degrades to a `false` result instead of failing, and the client
//! reconnects on its own on a backoff schedule.
//!
//! Connection attempts go through a circuit breaker that only counts
//! broker-availability failures ([`MessagingError::is_transient`]). Queue
//! declarations and consumer registrations are remembered and restored after
//! every successful (re)connect.
//!
//! The client spawns no tasks. Deliveries are dispatched to callbacks only
//! while the host drives [`ResilientQueueClient::process_pending`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BrokerConfig, RelayConfig};
use crate::logging::{log_error, log_queue_operation, panic_message};
use crate::messaging::backoff::{ReconnectBackoff, ReconnectPolicy, RetryPolicy};
use crate::messaging::broker::{BrokerChannel, BrokerConnection, BrokerConnector, Delivery};
use crate::messaging::status::{ClientHealthSnapshot, ClientStatus};
use crate::messaging::{validate_queue_name, MessagingError, MessagingResult};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};

const COMPONENT: &str = "queue_client";

/// Shortest pause between idle rounds of `consume_until_shutdown`
const MIN_CONSUME_SLICE: Duration = Duration::from_millis(10);

/// Consumer callback: receives the message body as text
pub type MessageCallback = Box<dyn FnMut(&str) -> anyhow::Result<()> + Send>;

type Session = (Box<dyn BrokerConnection>, Box<dyn BrokerChannel>);

/// Broker client with circuit breaking, degraded mode and automatic reconnect
pub struct ResilientQueueClient {
    client_id: Uuid,
    settings: BrokerConfig,
    retry_policy: RetryPolicy,
    connector: Arc<dyn BrokerConnector>,
    breaker: Arc<CircuitBreaker<MessagingError>>,
    status: Arc<ClientStatus>,

    connection: Option<Box<dyn BrokerConnection>>,
    channel: Option<Box<dyn BrokerChannel>>,
    backoff: ReconnectBackoff,

    /// Queue name -> durable, re-declared after every connect
    declared_queues: BTreeMap<String, bool>,
    consumers: BTreeMap<String, MessageCallback>,
    /// Queues with an active subscription on the current channel
    subscribed: BTreeSet<String>,

    degraded_notice_logged: bool,
    connection_lost_logged: bool,
}

impl fmt::Debug for ResilientQueueClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientQueueClient")
            .field("client_id", &self.client_id)
            .field("provider", &self.connector.provider_name())
            .field("broker", &self.settings.redacted_uri())
            .field("connected", &self.is_connected())
            .field("degraded", &self.is_degraded())
            .field("declared_queues", &self.declared_queues)
            .field("consumers", &self.consumers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResilientQueueClient {
    /// Create a disconnected client from the relay configuration
    pub fn new(config: &RelayConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        Self::from_parts(
            config.broker.clone(),
            config.circuit_breaker.to_circuit_breaker_config(),
            config.reconnect.retry_policy(),
            config.reconnect.reconnect_policy(),
            connector,
        )
    }

    /// Create a disconnected client talking to RabbitMQ
    #[cfg(feature = "rabbitmq")]
    pub fn rabbitmq(config: &RelayConfig) -> Self {
        Self::new(
            config,
            Arc::new(crate::messaging::providers::RabbitMqConnector::new()),
        )
    }

    /// Create a disconnected client from individual settings
    pub fn from_parts(
        settings: BrokerConfig,
        breaker_config: CircuitBreakerConfig,
        retry_policy: RetryPolicy,
        reconnect_policy: ReconnectPolicy,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        let breaker = Arc::new(
            CircuitBreaker::new("broker", breaker_config)
                .with_failure_filter(MessagingError::is_transient),
        );
        let client_id = Uuid::new_v4();

        debug!(
            client_id = %client_id,
            provider = connector.provider_name(),
            broker = %settings.redacted_uri(),
            "Queue client created"
        );

        Self {
            client_id,
            settings,
            retry_policy,
            connector,
            status: Arc::new(ClientStatus::new(Arc::clone(&breaker))),
            breaker,
            connection: None,
            channel: None,
            backoff: ReconnectBackoff::new(reconnect_policy),
            declared_queues: BTreeMap::new(),
            consumers: BTreeMap::new(),
            subscribed: BTreeSet::new(),
            degraded_notice_logged: false,
            connection_lost_logged: false,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Live, open connection and channel
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_open())
            && self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    pub fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }

    /// Shared status handle for health checks running on other tasks
    pub fn status(&self) -> Arc<ClientStatus> {
        Arc::clone(&self.status)
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker<MessagingError>> {
        &self.breaker
    }

    pub fn health_snapshot(&self) -> ClientHealthSnapshot {
        self.status.snapshot()
    }

    /// Current auto-reconnect throttle delay
    pub fn reconnect_delay(&self) -> Duration {
        self.backoff.current_delay()
    }

    /// Connect to the broker, retrying up to `max_retries` times.
    ///
    /// Returns `false` and enters degraded mode when the broker stays
    /// unreachable or the circuit breaker is open.
    pub async fn connect(&mut self, max_retries: u32) -> bool {
        if self.check_liveness() {
            return true;
        }

        if self.breaker.is_open() {
            warn!(
                client_id = %self.client_id,
                component = COMPONENT,
                "Circuit breaker open, skipping broker connection attempt"
            );
            self.status.mark_disconnected();
            self.log_degraded_notice();
            return false;
        }

        let attempts = max_retries.max(1);
        let policy = self.retry_policy;
        let mut delays = policy.delays();
        let breaker = Arc::clone(&self.breaker);
        let connector = Arc::clone(&self.connector);

        for attempt in 1..=attempts {
            self.backoff.record_attempt();

            let settings = &self.settings;
            let result = breaker
                .call(|| open_session(connector.as_ref(), settings))
                .await;

            match result {
                Ok((connection, channel)) => {
                    self.connection = Some(connection);
                    self.channel = Some(channel);
                    self.on_connected(attempt).await;
                    return true;
                }
                Err(CircuitBreakerError::CircuitOpen { component }) => {
                    warn!(
                        client_id = %self.client_id,
                        component = %component,
                        attempt,
                        "Circuit breaker opened, abandoning connection retries"
                    );
                    self.status.mark_disconnected();
                    self.log_degraded_notice();
                    return false;
                }
                Err(CircuitBreakerError::OperationFailed(err)) => {
                    warn!(
                        client_id = %self.client_id,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Broker connection attempt failed"
                    );
                    if attempt < attempts {
                        let delay = delays.next().unwrap_or(policy.max_delay);
                        info!(
                            client_id = %self.client_id,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying broker connection"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.status.record_connection_failure();
        self.status.mark_disconnected();
        log_error(
            COMPONENT,
            "connect",
            &format!("broker unreachable after {attempts} attempts"),
            Some(self.settings.redacted_uri().as_str()),
        );
        self.log_degraded_notice();
        false
    }

    /// Reconnect if the backoff delay has passed since the last attempt
    pub(crate) async fn auto_reconnect(&mut self) -> bool {
        if self.check_liveness() {
            return true;
        }

        if !self.backoff.is_due() {
            debug!(
                client_id = %self.client_id,
                remaining_ms = self.backoff.remaining().as_millis() as u64,
                "Reconnect throttled"
            );
            return false;
        }

        info!(
            client_id = %self.client_id,
            delay_ms = self.backoff.current_delay().as_millis() as u64,
            "Attempting automatic reconnect"
        );
        self.backoff.record_attempt();

        if self.connect(1).await {
            true
        } else {
            self.backoff.on_failure();
            debug!(
                client_id = %self.client_id,
                next_delay_ms = self.backoff.current_delay().as_millis() as u64,
                "Automatic reconnect failed"
            );
            false
        }
    }

    /// Declare a queue and remember it for restoration after reconnects.
    ///
    /// `Ok(false)` while degraded or when the broker rejects the declaration.
    pub async fn declare_queue(&mut self, queue_name: &str, durable: bool) -> MessagingResult<bool> {
        validate_queue_name(queue_name)?;
        self.declared_queues.insert(queue_name.to_string(), durable);

        if !self.check_liveness() {
            debug!(queue = queue_name, "Degraded, queue declaration deferred until reconnect");
            return Ok(false);
        }
        let Some(channel) = self.channel.as_mut() else {
            return Ok(false);
        };

        let result = channel.declare_queue(queue_name, durable).await;
        match result {
            Ok(()) => {
                log_queue_operation("declare_queue", Some(queue_name), "success", None);
                Ok(true)
            }
            Err(err) => {
                self.handle_operation_error("declare_queue", Some(queue_name), &err);
                Ok(false)
            }
        }
    }

    /// Publish a persistent message.
    ///
    /// While degraded the message is dropped and `Ok(false)` returned without
    /// touching the network. A failed publish schedules a throttled reconnect.
    pub async fn publish(&mut self, queue_name: &str, body: impl AsRef<[u8]>) -> MessagingResult<bool> {
        validate_queue_name(queue_name)?;
        let body = body.as_ref();

        if !self.check_liveness() {
            debug!(queue = queue_name, bytes = body.len(), "Degraded, message dropped");
            return Ok(false);
        }

        let timeout = self.settings.publish_timeout();
        let Some(channel) = self.channel.as_mut() else {
            return Ok(false);
        };

        let result = match tokio::time::timeout(timeout, channel.publish(queue_name, body, true)).await {
            Ok(result) => result,
            Err(_) => Err(MessagingError::timeout("publish", timeout)),
        };

        match result {
            Ok(()) => {
                debug!(queue = queue_name, bytes = body.len(), "Message published");
                Ok(true)
            }
            Err(err) => {
                self.handle_operation_error("publish", Some(queue_name), &err);
                self.auto_reconnect().await;
                Ok(false)
            }
        }
    }

    /// Register `callback` for a queue, replacing any previous one.
    ///
    /// Returns `Ok(true)` when the subscription is active now and `Ok(false)`
    /// when it will be activated on reconnect.
    pub async fn consume<F>(&mut self, queue_name: &str, callback: F) -> MessagingResult<bool>
    where
        F: FnMut(&str) -> anyhow::Result<()> + Send + 'static,
    {
        validate_queue_name(queue_name)?;
        let replaced = self
            .consumers
            .insert(queue_name.to_string(), Box::new(callback))
            .is_some();
        if replaced {
            debug!(queue = queue_name, "Consumer callback replaced");
        }

        if !self.check_liveness() {
            info!(queue = queue_name, "Degraded, consumer registered for activation on reconnect");
            return Ok(false);
        }
        if self.subscribed.contains(queue_name) {
            return Ok(true);
        }

        Ok(self.subscribe(queue_name).await)
    }

    /// Dispatch deliveries to their callbacks for up to `time_limit`.
    ///
    /// `Duration::ZERO` only handles what is already available. Returns the
    /// number of messages dispatched.
    pub async fn process_pending(&mut self, time_limit: Duration) -> usize {
        if !self.check_liveness() && !self.auto_reconnect().await {
            return 0;
        }

        let deadline = Instant::now() + time_limit;
        let mut dispatched = 0;

        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let Some(channel) = self.channel.as_mut() else {
                break;
            };

            let next = channel.next_delivery(wait).await;
            match next {
                Ok(Some(delivery)) => {
                    self.dispatch(delivery).await;
                    dispatched += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    self.handle_operation_error("consume", None, &err);
                    if err.is_transient() {
                        self.mark_connection_lost(&err.to_string());
                    }
                    self.auto_reconnect().await;
                    break;
                }
            }

            if !time_limit.is_zero() && Instant::now() >= deadline {
                break;
            }
        }

        if dispatched > 0 {
            debug!(client_id = %self.client_id, dispatched, "Processed pending deliveries");
        }
        dispatched
    }

    /// Keep dispatching deliveries in `slice`-long rounds until `shutdown`
    /// turns true or its sender is dropped. Returns the number dispatched.
    pub async fn consume_until_shutdown(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        slice: Duration,
    ) -> usize {
        let slice = slice.max(MIN_CONSUME_SLICE);
        let mut total = 0;
        info!(client_id = %self.client_id, consumers = self.consumers.len(), "Consuming until shutdown");

        while !*shutdown.borrow() {
            total += self.process_pending(slice).await;

            if !self.is_connected() {
                tokio::select! {
                    _ = tokio::time::sleep(slice) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            } else if shutdown.has_changed().is_err() {
                break;
            }
        }

        info!(client_id = %self.client_id, dispatched = total, "Stopped consuming");
        total
    }

    /// Close channel and connection. Safe to call repeatedly.
    pub async fn close(&mut self) {
        let had_session = self.connection.is_some() || self.channel.is_some();

        if let Some(mut channel) = self.channel.take() {
            let result = channel.close().await;
            if let Err(err) = result {
                log_error(COMPONENT, "close_channel", &err.to_string(), None);
            }
        }
        if let Some(mut connection) = self.connection.take() {
            let result = connection.close().await;
            if let Err(err) = result {
                log_error(COMPONENT, "close_connection", &err.to_string(), None);
            }
        }

        self.subscribed.clear();
        self.status.mark_disconnected();
        if had_session {
            log_queue_operation("close", None, "success", None);
        }
    }

    async fn on_connected(&mut self, attempt: u32) {
        self.status.mark_connected();
        self.backoff.on_success();
        self.subscribed.clear();
        self.degraded_notice_logged = false;
        self.connection_lost_logged = false;

        info!(
            client_id = %self.client_id,
            provider = self.connector.provider_name(),
            broker = %self.settings.redacted_uri(),
            attempt,
            "Connected to broker"
        );

        self.restore_topology().await;
    }

    /// Re-declare remembered queues and re-subscribe registered consumers
    async fn restore_topology(&mut self) {
        let queues: Vec<(String, bool)> = self
            .declared_queues
            .iter()
            .map(|(name, durable)| (name.clone(), *durable))
            .collect();

        for (queue_name, durable) in queues {
            let Some(channel) = self.channel.as_mut() else {
                return;
            };
            let result = channel.declare_queue(&queue_name, durable).await;
            if let Err(err) = result {
                self.handle_operation_error("restore_queue", Some(queue_name.as_str()), &err);
            }
        }

        let consumers: Vec<String> = self.consumers.keys().cloned().collect();
        for queue_name in consumers {
            if self.channel.is_none() {
                return;
            }
            self.subscribe(&queue_name).await;
        }

        if !self.declared_queues.is_empty() || !self.consumers.is_empty() {
            debug!(
                client_id = %self.client_id,
                queues = self.declared_queues.len(),
                consumers = self.subscribed.len(),
                "Topology restored"
            );
        }
    }

    async fn subscribe(&mut self, queue_name: &str) -> bool {
        let prefetch = self.settings.prefetch_count;
        let Some(channel) = self.channel.as_mut() else {
            return false;
        };

        let mut result = channel.set_prefetch(prefetch).await;
        if result.is_ok() {
            result = channel.subscribe(queue_name).await;
        }

        match result {
            Ok(()) => {
                self.subscribed.insert(queue_name.to_string());
                log_queue_operation("consume", Some(queue_name), "subscribed", None);
                true
            }
            Err(err) => {
                self.handle_operation_error("consume", Some(queue_name), &err);
                false
            }
        }
    }

    async fn dispatch(&mut self, delivery: Delivery) {
        match self.consumers.get_mut(&delivery.queue_name) {
            Some(callback) => {
                let text = delivery.text();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&*text)));
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(format!("{err:#}")),
                    Err(payload) => Some(format!("callback panicked: {}", panic_message(payload.as_ref()))),
                };
                if let Some(failure) = failure {
                    log_error(
                        COMPONENT,
                        "consumer_callback",
                        &failure,
                        Some(delivery.queue_name.as_str()),
                    );
                }
            }
            None => warn!(
                queue = %delivery.queue_name,
                delivery_tag = delivery.delivery_tag,
                "Delivery for a queue without a registered consumer"
            ),
        }

        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        let result = channel.ack(&delivery).await;
        if let Err(err) = result {
            self.handle_operation_error("ack", Some(delivery.queue_name.as_str()), &err);
        }
    }

    /// Log a failed operation and drop the session if it died with it
    fn handle_operation_error(&mut self, operation: &str, queue_name: Option<&str>, err: &MessagingError) {
        log_error(COMPONENT, operation, &err.to_string(), queue_name);

        let session_error = matches!(
            err,
            MessagingError::Connection { .. }
                | MessagingError::ChannelClosed { .. }
                | MessagingError::NotConnected
        );
        if session_error || !self.check_liveness() {
            self.mark_connection_lost(&err.to_string());
        }
    }

    /// True when the session is usable; drops dead handles otherwise
    fn check_liveness(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }
        if self.connection.is_some() || self.channel.is_some() {
            self.mark_connection_lost("connection or channel closed");
        }
        false
    }

    fn mark_connection_lost(&mut self, reason: &str) {
        let had_session = self.connection.take().is_some() | self.channel.take().is_some();
        self.subscribed.clear();
        self.status.mark_disconnected();

        if had_session && !self.connection_lost_logged {
            self.connection_lost_logged = true;
            warn!(client_id = %self.client_id, reason, "Broker connection lost");
        }
        self.log_degraded_notice();
    }

    fn log_degraded_notice(&mut self) {
        if self.degraded_notice_logged {
            return;
        }
        self.degraded_notice_logged = true;
        warn!(
            client_id = %self.client_id,
            broker = %self.settings.redacted_uri(),
            reconnect_delay_ms = self.backoff.current_delay().as_millis() as u64,
            "Running in degraded mode: messages are dropped until the broker is reachable"
        );
    }
}

async fn open_session(connector: &dyn BrokerConnector, settings: &BrokerConfig) -> MessagingResult<Session> {
    let mut connection = connector.connect(settings).await?;

    let mut channel = match connection.open_channel().await {
        Ok(channel) => channel,
        Err(err) => {
            let _ = connection.close().await;
            return Err(err);
        }
    };

    if let Err(err) = channel.set_prefetch(settings.prefetch_count).await {
        let _ = channel.close().await;
        let _ = connection.close().await;
        return Err(err);
    }

    Ok((connection, channel))
}
