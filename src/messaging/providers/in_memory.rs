//! # In-Memory Broker
//!
//! Thread-safe in-memory broker for tests and local development.
//!
//! ## Features
//!
//! - **AMQP-like semantics**: default-exchange routing, prefetch, manual ack,
//!   redelivery of unacknowledged messages when a channel goes away
//! - **Fault injection**: refuse connections, sever live connections, block or fail
//!   upcoming publishes
//! - **Inspection**: queue depth, unacked counts, connection attempts
//!
//! Every clone of an [`InMemoryBroker`] shares the same state, so a test can
//! hold one handle for fault injection while the client connects through
//! another.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::BrokerConfig;
use crate::messaging::broker::{BrokerChannel, BrokerConnection, BrokerConnector, Delivery};
use crate::messaging::{MessagingError, MessagingResult};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct InMemoryQueue {
    durable: bool,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct InFlight {
    queue_name: String,
    body: Vec<u8>,
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    /// Bumped whenever live connections are cut; handles from older epochs are dead
    epoch: u64,
    connection_attempts: u64,
    failing_publishes: u32,
    /// Publishes wait while set, like a RabbitMQ `connection.blocked`
    publishes_blocked: bool,
    next_channel_id: u64,
    queues: BTreeMap<String, InMemoryQueue>,
    /// Unacknowledged deliveries per channel, keyed by delivery tag
    in_flight: HashMap<u64, BTreeMap<u64, InFlight>>,
}

impl BrokerState {
    fn is_alive(&self, epoch: u64) -> bool {
        self.available && self.epoch == epoch
    }

    fn requeue_channel(&mut self, channel_id: u64) -> usize {
        let Some(deliveries) = self.in_flight.remove(&channel_id) else {
            return 0;
        };
        let count = deliveries.len();
        // Newest first so the oldest ends up at the head of the queue
        for (_, delivery) in deliveries.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&delivery.queue_name) {
                queue.ready.push_front(StoredMessage {
                    body: delivery.body,
                    redelivered: true,
                });
            }
        }
        count
    }

    fn requeue_all(&mut self) -> usize {
        let channels: Vec<u64> = self.in_flight.keys().copied().collect();
        channels
            .into_iter()
            .map(|id| self.requeue_channel(id))
            .sum()
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// In-memory broker shared by every connection made through it
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an available broker with no queues
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    available: true,
                    epoch: 0,
                    connection_attempts: 0,
                    failing_publishes: 0,
                    publishes_blocked: false,
                    next_channel_id: 1,
                    queues: BTreeMap::new(),
                    in_flight: HashMap::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Start or stop the broker. Stopping cuts every live connection, returns
    /// unacknowledged messages to their queues and drops non-durable queues.
    pub fn set_available(&self, available: bool) {
        let mut state = self.shared.state.lock();
        if state.available == available {
            return;
        }
        state.available = available;
        if !available {
            state.epoch += 1;
            state.requeue_all();
            state.queues.retain(|_, queue| queue.durable);
        }
        drop(state);
        debug!(available, "In-memory broker availability changed");
        self.shared.notify.notify_waiters();
    }

    pub fn is_available(&self) -> bool {
        self.shared.state.lock().available
    }

    /// Cut every live connection while still accepting new ones
    pub fn sever_connections(&self) {
        let mut state = self.shared.state.lock();
        state.epoch += 1;
        let requeued = state.requeue_all();
        drop(state);
        debug!(requeued, "In-memory broker severed connections");
        self.shared.notify.notify_waiters();
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.state.lock().failing_publishes = count;
    }

    /// Hold every publish until unblocked
    pub fn block_publishes(&self, blocked: bool) {
        self.shared.state.lock().publishes_blocked = blocked;
        debug!(blocked, "In-memory broker publish flow changed");
        self.shared.notify.notify_waiters();
    }

    /// Connection attempts seen so far, successful or not
    pub fn connection_attempts(&self) -> u64 {
        self.shared.state.lock().connection_attempts
    }

    /// Messages waiting for delivery
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue_name)
            .map_or(0, |queue| queue.ready.len())
    }

    /// Messages delivered but not yet acknowledged
    pub fn unacked_count(&self, queue_name: &str) -> usize {
        self.shared
            .state
            .lock()
            .in_flight
            .values()
            .flat_map(|deliveries| deliveries.values())
            .filter(|delivery| delivery.queue_name == queue_name)
            .count()
    }

    pub fn has_queue(&self, queue_name: &str) -> bool {
        self.shared.state.lock().queues.contains_key(queue_name)
    }

    pub fn is_durable(&self, queue_name: &str) -> Option<bool> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue_name)
            .map(|queue| queue.durable)
    }

    /// Drain and return the bodies waiting in a queue
    pub fn drain(&self, queue_name: &str) -> Vec<Vec<u8>> {
        self.shared
            .state
            .lock()
            .queues
            .get_mut(queue_name)
            .map(|queue| queue.ready.drain(..).map(|m| m.body).collect())
            .unwrap_or_default()
    }

    /// Enqueue a message without a connection. Returns false when the queue
    /// does not exist.
    pub fn publish_direct(&self, queue_name: &str, body: impl Into<Vec<u8>>) -> bool {
        let mut state = self.shared.state.lock();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return false;
        };
        queue.ready.push_back(StoredMessage {
            body: body.into(),
            redelivered: false,
        });
        drop(state);
        self.shared.notify.notify_waiters();
        true
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, _settings: &BrokerConfig) -> MessagingResult<Box<dyn BrokerConnection>> {
        let mut state = self.shared.state.lock();
        state.connection_attempts += 1;
        if !state.available {
            return Err(MessagingError::connection("in-memory broker is unavailable"));
        }

        Ok(Box::new(InMemoryConnection {
            broker: self.clone(),
            epoch: state.epoch,
            closed: false,
        }))
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

#[derive(Debug)]
struct InMemoryConnection {
    broker: InMemoryBroker,
    epoch: u64,
    closed: bool,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn is_open(&self) -> bool {
        !self.closed && self.broker.shared.state.lock().is_alive(self.epoch)
    }

    async fn open_channel(&mut self) -> MessagingResult<Box<dyn BrokerChannel>> {
        if self.closed {
            return Err(MessagingError::connection("connection is closed"));
        }
        let mut state = self.broker.shared.state.lock();
        if !state.is_alive(self.epoch) {
            return Err(MessagingError::connection("connection lost"));
        }
        let id = state.next_channel_id;
        state.next_channel_id += 1;

        Ok(Box::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
            epoch: self.epoch,
            closed: false,
            prefetch: None,
            subscriptions: Vec::new(),
            next_tag: 1,
            next_subscription: 0,
        }))
    }

    async fn close(&mut self) -> MessagingResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Debug)]
struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    epoch: u64,
    closed: bool,
    prefetch: Option<u16>,
    subscriptions: Vec<String>,
    next_tag: u64,
    /// Rotates the starting subscription so no queue starves the others
    next_subscription: usize,
}

impl InMemoryChannel {
    fn ensure_alive(&self, state: &BrokerState) -> MessagingResult<()> {
        if self.closed {
            return Err(MessagingError::channel_closed("channel is closed"));
        }
        if !state.is_alive(self.epoch) {
            return Err(MessagingError::channel_closed("connection lost"));
        }
        Ok(())
    }

    /// Hand out the next ready message from the subscribed queues, if the
    /// prefetch window allows it
    fn try_take(&mut self, state: &mut BrokerState) -> Option<Delivery> {
        if self.subscriptions.is_empty() {
            return None;
        }
        let in_flight = state.in_flight.get(&self.id).map_or(0, BTreeMap::len);
        if let Some(limit) = self.prefetch {
            if in_flight >= usize::from(limit) {
                return None;
            }
        }

        let count = self.subscriptions.len();
        for offset in 0..count {
            let index = (self.next_subscription + offset) % count;
            let queue_name = &self.subscriptions[index];
            let Some(message) = state
                .queues
                .get_mut(queue_name)
                .and_then(|queue| queue.ready.pop_front())
            else {
                continue;
            };

            let delivery_tag = self.next_tag;
            self.next_tag += 1;
            self.next_subscription = (index + 1) % count;

            state.in_flight.entry(self.id).or_default().insert(
                delivery_tag,
                InFlight {
                    queue_name: queue_name.clone(),
                    body: message.body.clone(),
                },
            );

            return Some(Delivery {
                queue_name: queue_name.clone(),
                delivery_tag,
                body: message.body,
                redelivered: message.redelivered,
            });
        }
        None
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let requeued = self.broker.shared.state.lock().requeue_channel(self.id);
        if requeued > 0 {
            trace!(channel = self.id, requeued, "Requeued unacked deliveries");
            self.broker.shared.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed && self.broker.shared.state.lock().is_alive(self.epoch)
    }

    async fn set_prefetch(&mut self, count: u16) -> MessagingResult<()> {
        self.ensure_alive(&self.broker.shared.state.lock())?;
        self.prefetch = (count > 0).then_some(count);
        Ok(())
    }

    async fn declare_queue(&mut self, queue_name: &str, durable: bool) -> MessagingResult<()> {
        let mut state = self.broker.shared.state.lock();
        self.ensure_alive(&state)?;

        match state.queues.get(queue_name) {
            Some(existing) if existing.durable != durable => Err(MessagingError::queue_declare(
                queue_name,
                format!(
                    "PRECONDITION_FAILED: inequivalent arg 'durable' (existing {}, requested {durable})",
                    existing.durable
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue_name.to_string(),
                    InMemoryQueue {
                        durable,
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn publish(&mut self, queue_name: &str, body: &[u8], _persistent: bool) -> MessagingResult<()> {
        let broker = self.broker.clone();

        loop {
            let notified = broker.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = broker.shared.state.lock();
                self.ensure_alive(&state)?;

                if !state.publishes_blocked {
                    if state.failing_publishes > 0 {
                        state.failing_publishes -= 1;
                        return Err(MessagingError::publish(queue_name, "injected publish failure"));
                    }

                    match state.queues.get_mut(queue_name) {
                        Some(queue) => queue.ready.push_back(StoredMessage {
                            body: body.to_vec(),
                            redelivered: false,
                        }),
                        // Default exchange drops messages for unknown queues
                        None => trace!(queue = queue_name, "Dropped message for unknown queue"),
                    }
                    drop(state);
                    broker.shared.notify.notify_waiters();
                    return Ok(());
                }
            }

            trace!(queue = queue_name, "Publish waiting on blocked connection");
            notified.await;
        }
    }

    async fn subscribe(&mut self, queue_name: &str) -> MessagingResult<()> {
        let state = self.broker.shared.state.lock();
        self.ensure_alive(&state)?;
        if !state.queues.contains_key(queue_name) {
            return Err(MessagingError::consume(
                queue_name,
                "NOT_FOUND: no queue with that name",
            ));
        }
        drop(state);

        if !self.subscriptions.iter().any(|q| q == queue_name) {
            self.subscriptions.push(queue_name.to_string());
        }
        Ok(())
    }

    async fn next_delivery(&mut self, wait: Duration) -> MessagingResult<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        let broker = self.broker.clone();

        loop {
            let notified = broker.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = broker.shared.state.lock();
                self.ensure_alive(&state)?;
                if let Some(delivery) = self.try_take(&mut state) {
                    return Ok(Some(delivery));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> MessagingResult<()> {
        let mut state = self.broker.shared.state.lock();
        self.ensure_alive(&state)?;

        let removed = state
            .in_flight
            .get_mut(&self.id)
            .and_then(|deliveries| deliveries.remove(&delivery.delivery_tag));
        if removed.is_none() {
            return Err(MessagingError::ack(
                &delivery.queue_name,
                delivery.delivery_tag,
                "PRECONDITION_FAILED: unknown delivery tag",
            ));
        }
        drop(state);
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> MessagingResult<()> {
        self.release();
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.release();
    }
}
