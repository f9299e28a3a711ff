//! In-memory broker implementation for testing and development.
//!
//! This module provides a broker living entirely in process memory that:
//! - Delivers queued messages in FIFO order, bounded by subscription credit
//! - Implements accept, reject (dead letter) and modify dispositions
//! - Tracks delivery counts and per-subscription "undeliverable here" marks
//! - Releases unsettled deliveries when a subscription or connection goes away
//! - Lets tests inject connection failures, refused subscriptions and disconnects
//!
//! Connections handed out by [`InMemoryConnectionProvider`] carry a client
//! identifier of the form `<id_endpoint>_<uuid>`.

use crate::configuration::{Endpoint, SubscriptionSettings};
use crate::connection::{BrokerConnection, BrokerSubscription, ConnectionProvider};
use crate::error::ConsumerError;
use crate::message::{DeliveryTag, Message, MessageId, ReceivedMessage, SubscriptionId, Timestamp};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Client identifiers remembered for inspection, oldest dropped first
const CLIENT_ID_HISTORY: usize = 64;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Broker state shared by every handle
struct Shared {
    state: Mutex<BrokerState>,
    /// Signalled whenever a blocked receiver might be able to make progress
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, InMemoryQueue>,
    connections: HashMap<u64, ConnectionEntry>,
    subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
    client_ids: VecDeque<String>,
    next_connection_id: u64,
    next_subscription_id: u64,
    connection_attempts: u64,
    connections_created: u64,
    subscriptions_created: u64,
    fail_connections: bool,
    reject_subscriptions: bool,
    /// New connections start closed when set
    start_closed: bool,
    last_settings: Option<SubscriptionSettings>,
}

impl BrokerState {
    fn is_connection_open(&self, connection_id: u64) -> bool {
        self.connections
            .get(&connection_id)
            .map_or(false, |connection| connection.opened)
    }

    /// Detach a subscription and hand its unsettled deliveries back to the queue
    ///
    /// The entry is removed; later calls for the same id are no-ops.
    fn release_subscription(&mut self, id: SubscriptionId) {
        let Some(entry) = self.subscriptions.remove(&id) else {
            return;
        };

        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            let mut tags: Vec<DeliveryTag> = queue
                .in_flight
                .keys()
                .filter(|tag| tag.subscription_id() == id)
                .copied()
                .collect();
            tags.sort_by_key(|tag| std::cmp::Reverse(tag.sequence()));

            for tag in tags {
                if let Some(stored) = queue.in_flight.remove(&tag) {
                    queue.ready.push_front(stored);
                }
            }
        }
    }

    /// Forget a connection and release every subscription it owns
    fn close_connection(&mut self, connection_id: u64) {
        self.connections.remove(&connection_id);

        let owned: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|(_, entry)| entry.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();

        for id in owned {
            self.release_subscription(id);
        }
    }

    fn record_client_id(&mut self, client_id: String) {
        if self.client_ids.len() == CLIENT_ID_HISTORY {
            self.client_ids.pop_front();
        }
        self.client_ids.push_back(client_id);
    }
}

struct ConnectionEntry {
    opened: bool,
}

struct SubscriptionEntry {
    connection_id: u64,
    queue: String,
    credit: u32,
    next_sequence: u64,
}

/// Internal state for a single queue
#[derive(Default)]
struct InMemoryQueue {
    /// Messages waiting for delivery (FIFO order)
    ready: VecDeque<StoredMessage>,
    /// Delivered but not yet settled
    in_flight: HashMap<DeliveryTag, StoredMessage>,
    dead_letter: Vec<StoredMessage>,
    accepted: u64,
}

/// A message stored in a queue with broker metadata
#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: Bytes,
    properties: HashMap<String, String>,
    correlation_id: Option<String>,
    delivery_count: u32,
    /// Subscriptions that must not receive this message again
    undeliverable_for: HashSet<SubscriptionId>,
}

impl StoredMessage {
    fn from_message(message: Message, message_id: MessageId) -> Self {
        Self {
            message_id,
            body: message.body,
            properties: message.properties,
            correlation_id: message.correlation_id,
            delivery_count: 0,
            undeliverable_for: HashSet::new(),
        }
    }

    fn to_received(&self, delivery_tag: DeliveryTag) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id.clone(),
            body: self.body.clone(),
            properties: self.properties.clone(),
            correlation_id: self.correlation_id.clone(),
            delivery_tag,
            delivery_count: self.delivery_count,
            received_at: Timestamp::now(),
        }
    }

    fn to_message(&self) -> Message {
        Message {
            body: self.body.clone(),
            properties: self.properties.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// Process-local broker; clones share the same queues
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    next_connection_id: 1,
                    next_subscription_id: 1,
                    ..Default::default()
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Connection provider whose client ids are prefixed with `id_endpoint`
    pub fn connection_provider(&self, id_endpoint: impl Into<String>) -> InMemoryConnectionProvider {
        InMemoryConnectionProvider {
            shared: Arc::clone(&self.shared),
            id_endpoint: id_endpoint.into(),
        }
    }

    /// Enqueue a message on `queue`
    pub fn publish(&self, queue: &str, message: Message) -> MessageId {
        let message_id = MessageId::new();
        {
            let mut state = self.shared.lock();
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_back(StoredMessage::from_message(message, message_id.clone()));
        }
        self.shared.changed.notify_waiters();
        message_id
    }

    /// Make every subsequent connection attempt fail
    pub fn set_fail_connections(&self, fail: bool) {
        self.shared.lock().fail_connections = fail;
    }

    /// Make every subsequent subscription request be refused
    pub fn set_reject_subscriptions(&self, reject: bool) {
        self.shared.lock().reject_subscriptions = reject;
    }

    /// Whether new connections report themselves open
    pub fn set_connections_open(&self, open: bool) {
        self.shared.lock().start_closed = !open;
    }

    /// Drop every open connection from the broker side
    pub fn close_connections(&self) {
        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, connection)| connection.opened)
                .map(|(id, _)| *id)
                .collect();

            for id in open {
                state.close_connection(id);
            }
        }
        self.shared.changed.notify_waiters();
    }

    /// Connection attempts, successful or not
    pub fn connection_attempts(&self) -> u64 {
        self.shared.lock().connection_attempts
    }

    pub fn connections_created(&self) -> u64 {
        self.shared.lock().connections_created
    }

    pub fn subscriptions_created(&self) -> u64 {
        self.shared.lock().subscriptions_created
    }

    pub fn open_connections(&self) -> usize {
        self.shared
            .lock()
            .connections
            .values()
            .filter(|connection| connection.opened)
            .count()
    }

    /// Client identifiers of the most recently created connections, oldest first
    pub fn client_ids(&self) -> Vec<String> {
        self.shared.lock().client_ids.iter().cloned().collect()
    }

    pub fn last_subscription_settings(&self) -> Option<SubscriptionSettings> {
        self.shared.lock().last_settings.clone()
    }

    /// Messages waiting for delivery
    pub fn ready_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len())
    }

    /// Messages delivered but not settled
    pub fn in_flight_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.in_flight.len())
    }

    pub fn accepted_count(&self, queue: &str) -> u64 {
        self.with_queue(queue, |q| q.accepted)
    }

    pub fn dead_letter_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.dead_letter.len())
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<Message> {
        self.with_queue(queue, |q| q.dead_letter.iter().map(StoredMessage::to_message).collect())
    }

    fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&InMemoryQueue) -> T) -> T {
        self.shared.lock().queues.get(queue).map(f).unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Connection Provider
// ============================================================================

/// Hands out connections to an [`InMemoryBroker`]
#[derive(Clone)]
pub struct InMemoryConnectionProvider {
    shared: Arc<Shared>,
    id_endpoint: String,
}

#[async_trait]
impl ConnectionProvider for InMemoryConnectionProvider {
    async fn create(
        &self,
        endpoints: &[Endpoint],
        cancel: &CancellationToken,
    ) -> Result<Box<dyn BrokerConnection>, ConsumerError> {
        if cancel.is_cancelled() {
            return Err(ConsumerError::Cancelled);
        }

        let mut state = self.shared.lock();
        state.connection_attempts += 1;

        if endpoints.is_empty() {
            return Err(ConsumerError::Connection {
                message: "no endpoints supplied".to_string(),
            });
        }

        if state.fail_connections {
            let targets: Vec<String> = endpoints.iter().map(Endpoint::url).collect();
            return Err(ConsumerError::Connection {
                message: format!("broker unavailable at {}", targets.join(", ")),
            });
        }

        let connection_id = state.next_connection_id;
        state.next_connection_id += 1;
        state.connections_created += 1;

        let client_id = format!("{}_{}", self.id_endpoint, uuid::Uuid::new_v4());
        let opened = !state.start_closed;
        state.connections.insert(connection_id, ConnectionEntry { opened });
        state.record_client_id(client_id.clone());

        debug!(
            client_id = %client_id,
            url = %endpoints[0].url(),
            opened = opened,
            "In-memory connection created"
        );

        Ok(Box::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            connection_id,
            client_id,
        }))
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Connection handle to an [`InMemoryBroker`]
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    connection_id: u64,
    client_id: String,
}

impl InMemoryConnection {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_subscription(
        &self,
        settings: &SubscriptionSettings,
    ) -> Result<Box<dyn BrokerSubscription>, ConsumerError> {
        let mut state = self.shared.lock();

        let refuse = |message: &str| ConsumerError::Subscription {
            message: message.to_string(),
        };

        if !state.is_connection_open(self.connection_id) {
            return Err(refuse("connection is closed"));
        }
        if state.reject_subscriptions {
            return Err(refuse("subscription refused by broker"));
        }
        if settings.filter_expression.is_some() {
            return Err(refuse("filter expressions are not supported by the in-memory broker"));
        }
        if settings.credit == 0 {
            return Err(refuse("credit must be positive"));
        }

        let id = SubscriptionId::new(state.next_subscription_id);
        state.next_subscription_id += 1;
        state.subscriptions_created += 1;

        let queue = settings.queue_name().to_string();
        state.queues.entry(queue.clone()).or_default();
        state.subscriptions.insert(
            id,
            SubscriptionEntry {
                connection_id: self.connection_id,
                queue: queue.clone(),
                credit: settings.credit,
                next_sequence: 0,
            },
        );
        state.last_settings = Some(settings.clone());

        debug!(
            client_id = %self.client_id,
            subscription_id = %id,
            queue = %queue,
            credit = settings.credit,
            "In-memory subscription attached"
        );

        Ok(Box::new(InMemorySubscription {
            shared: Arc::clone(&self.shared),
            id,
            connection_id: self.connection_id,
            queue,
        }))
    }

    fn is_opened(&self) -> bool {
        self.shared.lock().is_connection_open(self.connection_id)
    }

    async fn dispose(&self) -> Result<(), ConsumerError> {
        self.shared.lock().close_connection(self.connection_id);
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Subscription handle reading one queue of an [`InMemoryBroker`]
pub struct InMemorySubscription {
    shared: Arc<Shared>,
    id: SubscriptionId,
    connection_id: u64,
    queue: String,
}

impl InMemorySubscription {
    /// Deliver the next eligible message if credit allows
    fn try_receive(&self) -> Result<Option<ReceivedMessage>, ConsumerError> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        if !state.is_connection_open(self.connection_id) {
            return Err(ConsumerError::Receive {
                message: "connection is closed".to_string(),
            });
        }

        let entry = state
            .subscriptions
            .get_mut(&self.id)
            .ok_or_else(|| ConsumerError::Receive {
                message: format!("subscription {} is detached", self.id),
            })?;

        let queue = state.queues.entry(self.queue.clone()).or_default();

        let outstanding = queue
            .in_flight
            .keys()
            .filter(|tag| tag.subscription_id() == self.id)
            .count();
        if outstanding >= entry.credit as usize {
            return Ok(None);
        }

        let Some(position) = queue
            .ready
            .iter()
            .position(|stored| !stored.undeliverable_for.contains(&self.id))
        else {
            return Ok(None);
        };
        let Some(stored) = queue.ready.remove(position) else {
            return Ok(None);
        };

        entry.next_sequence += 1;
        let tag = DeliveryTag::new(self.id, entry.next_sequence);
        let received = stored.to_received(tag);
        queue.in_flight.insert(tag, stored);

        Ok(Some(received))
    }

    /// Remove an unsettled delivery owned by this subscription
    fn settle<F>(&self, message: &ReceivedMessage, action: &str, f: F) -> Result<(), ConsumerError>
    where
        F: FnOnce(&mut InMemoryQueue, StoredMessage),
    {
        let disposition_error = |message: String| ConsumerError::Disposition {
            action: action.to_string(),
            message,
        };

        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;

            let attached = state.is_connection_open(self.connection_id)
                && state.subscriptions.contains_key(&self.id);
            if !attached {
                return Err(disposition_error(format!("subscription {} is detached", self.id)));
            }

            let queue = state
                .queues
                .get_mut(&self.queue)
                .ok_or_else(|| disposition_error(format!("queue {} does not exist", self.queue)))?;

            let stored = queue.in_flight.remove(&message.delivery_tag).ok_or_else(|| {
                disposition_error(format!("message {} is not awaiting settlement", message.message_id))
            })?;

            f(queue, stored);
        }

        self.shared.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BrokerSubscription for InMemorySubscription {
    fn subscription_id(&self) -> SubscriptionId {
        self.id
    }

    async fn receive(&self, cancel: &CancellationToken) -> Result<ReceivedMessage, ConsumerError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ConsumerError::Cancelled);
            }

            // Register interest before inspecting state so no wakeup is missed
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_receive()? {
                return Ok(message);
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(ConsumerError::Cancelled),
            }
        }
    }

    async fn accept(&self, message: &ReceivedMessage) -> Result<(), ConsumerError> {
        self.settle(message, "accept", |queue, _| queue.accepted += 1)
    }

    fn reject(&self, message: &ReceivedMessage) -> Result<(), ConsumerError> {
        self.settle(message, "reject", |queue, stored| queue.dead_letter.push(stored))
    }

    fn modify(
        &self,
        message: &ReceivedMessage,
        increment_delivery_count: bool,
        undeliverable_here: bool,
    ) -> Result<(), ConsumerError> {
        let id = self.id;
        self.settle(message, "modify", move |queue, mut stored| {
            if increment_delivery_count {
                stored.delivery_count += 1;
            }
            if undeliverable_here {
                stored.undeliverable_for.insert(id);
            }
            queue.ready.push_front(stored);
        })
    }

    async fn dispose(&self) -> Result<(), ConsumerError> {
        self.shared.lock().release_subscription(self.id);
        self.shared.changed.notify_waiters();
        Ok(())
    }
}
