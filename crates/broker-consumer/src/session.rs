//! # Consumer Session Module
//!
//! State machine owning one broker connection and one subscription.
//!
//! ```text
//! Uninitialized --create_consumer--> Running --dispose--> Disposed
//!                                       |                    |
//!                          (broker drops connection)   create_consumer builds
//!                                       v               a fresh handle pair
//!                                  Disconnected
//! ```
//!
//! A handle pair is never repaired in place: once the connection drops, the
//! pair is disposed and `create_consumer` builds a new one. Application
//! logic is injected as a [`MessageHandler`] and settles messages through the
//! [`MessageContext`] it is handed.

use crate::configuration::ConsumerConfiguration;
use crate::connection::{BrokerConnection, BrokerSubscription, ConnectionProvider};
use crate::correlation::CorrelationId;
use crate::error::ConsumerError;
use crate::message::{ReceivedMessage, SubscriptionId};
use crate::outcome::DeliveryOutcome;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

// ============================================================================
// Message Handling
// ============================================================================

/// Application logic invoked once per received message
///
/// The handler decides the delivery outcome through `context`. Returning an
/// error leaves the message unsettled; the broker redelivers it once the
/// subscription is released.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, context: MessageContext, message: ReceivedMessage) -> anyhow::Result<()>;
}

/// [`MessageHandler`] backed by an async closure, see [`handler_fn`]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`MessageHandler`]
///
/// # Example
///
/// ```rust
/// use broker_consumer::session::handler_fn;
///
/// let handler = handler_fn(|context, message| async move {
///     context.accept(&message).await?;
///     Ok::<(), anyhow::Error>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(MessageContext, ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(MessageContext, ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, context: MessageContext, message: ReceivedMessage) -> anyhow::Result<()> {
        (self.f)(context, message).await
    }
}

/// Settlement surface handed to a [`MessageHandler`] with each message
#[derive(Clone)]
pub struct MessageContext {
    subscription: Arc<dyn BrokerSubscription>,
    correlation_id: CorrelationId,
    id_endpoint: Arc<str>,
}

impl MessageContext {
    fn new(
        subscription: Arc<dyn BrokerSubscription>,
        correlation_id: CorrelationId,
        id_endpoint: Arc<str>,
    ) -> Self {
        Self {
            subscription,
            correlation_id,
            id_endpoint,
        }
    }

    /// Correlation identifier of this processing attempt
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Endpoint identifier of the owning session
    pub fn id_endpoint(&self) -> &str {
        &self.id_endpoint
    }

    /// Settle `message` as processed; the broker forgets it
    pub async fn accept(&self, message: &ReceivedMessage) -> Result<(), ConsumerError> {
        self.delivery(message, DeliveryOutcome::Accept, false).await
    }

    /// Settle `message` as unprocessable; the broker dead-letters it
    pub async fn reject(&self, message: &ReceivedMessage) -> Result<(), ConsumerError> {
        self.delivery(message, DeliveryOutcome::Reject, false).await
    }

    /// Hand `message` back without counting a delivery attempt
    ///
    /// With `undeliverable_here` the broker will not offer it to this
    /// subscription again.
    pub async fn release(
        &self,
        message: &ReceivedMessage,
        undeliverable_here: bool,
    ) -> Result<(), ConsumerError> {
        self.delivery(message, DeliveryOutcome::Release, undeliverable_here)
            .await
    }

    /// Hand `message` back and increment its delivery count
    pub async fn retry(
        &self,
        message: &ReceivedMessage,
        undeliverable_here: bool,
    ) -> Result<(), ConsumerError> {
        self.delivery(message, DeliveryOutcome::Retry, undeliverable_here)
            .await
    }

    /// Settle `message` with `outcome`
    pub async fn delivery(
        &self,
        message: &ReceivedMessage,
        outcome: DeliveryOutcome,
        undeliverable_here: bool,
    ) -> Result<(), ConsumerError> {
        dispatch(
            self.subscription.as_ref(),
            message,
            outcome,
            undeliverable_here,
        )
        .await
    }

    /// Settle `message` with a numeric outcome code
    pub async fn delivery_code(
        &self,
        message: &ReceivedMessage,
        code: i32,
        undeliverable_here: bool,
    ) -> Result<(), ConsumerError> {
        let outcome = DeliveryOutcome::try_from(code)?;
        self.delivery(message, outcome, undeliverable_here).await
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("subscription_id", &self.subscription.subscription_id())
            .field("correlation_id", &self.correlation_id)
            .field("id_endpoint", &self.id_endpoint)
            .finish()
    }
}

/// Forward one delivery outcome to the broker
async fn dispatch(
    subscription: &dyn BrokerSubscription,
    message: &ReceivedMessage,
    outcome: DeliveryOutcome,
    undeliverable_here: bool,
) -> Result<(), ConsumerError> {
    let owner = message.subscription_id();
    if owner != subscription.subscription_id() {
        return Err(ConsumerError::MessageNotOwned { owner });
    }

    debug!(
        message_id = %message.message_id,
        outcome = %outcome,
        undeliverable_here = undeliverable_here,
        "Settling message"
    );

    match outcome {
        DeliveryOutcome::Accept => subscription.accept(message).await,
        DeliveryOutcome::Reject => subscription.reject(message),
        DeliveryOutcome::Release => subscription.modify(message, false, undeliverable_here),
        DeliveryOutcome::Retry => subscription.modify(message, true, undeliverable_here),
    }
}

// ============================================================================
// Consumer Session
// ============================================================================

/// Observable lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No consumer has been created yet
    Uninitialized,
    /// Connection open and subscription attached
    Running,
    /// Handles exist but the broker closed the connection
    Disconnected,
    /// The last handle pair was released
    Disposed,
}

/// One connection plus one subscription for a single endpoint identifier
pub struct ConsumerSession {
    configuration: Arc<ConsumerConfiguration>,
    id_endpoint: Arc<str>,
    provider: Arc<dyn ConnectionProvider>,
    handler: Arc<dyn MessageHandler>,
    connection: Option<Box<dyn BrokerConnection>>,
    subscription: Option<Arc<dyn BrokerSubscription>>,
    disposed: bool,
}

impl ConsumerSession {
    /// Create an uninitialized session; nothing connects until
    /// [`create_consumer`](Self::create_consumer)
    pub fn new(
        configuration: ConsumerConfiguration,
        provider: Arc<dyn ConnectionProvider>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let id_endpoint: Arc<str> = Arc::from(configuration.id_endpoint.as_str());
        Self {
            configuration: Arc::new(configuration),
            id_endpoint,
            provider,
            handler,
            connection: None,
            subscription: None,
            disposed: false,
        }
    }

    /// Configuration the session was built from
    pub fn configuration(&self) -> &ConsumerConfiguration {
        &self.configuration
    }

    /// Endpoint identifier this session consumes for
    pub fn id_endpoint(&self) -> &str {
        &self.id_endpoint
    }

    /// Whether the configuration enables this consumer at all
    pub fn is_active(&self) -> bool {
        self.configuration.is_active
    }

    /// Retry delay in milliseconds
    pub fn retry_time(&self) -> u64 {
        self.configuration.retry_time
    }

    /// Retry delay as a [`Duration`]
    pub fn retry_delay(&self) -> Duration {
        self.configuration.retry_delay()
    }

    /// True iff the connection is open and a subscription is attached
    ///
    /// Evaluated on every call; the broker may close the connection at any time.
    pub fn is_running(&self) -> bool {
        let connection_open = self
            .connection
            .as_ref()
            .map_or(false, |connection| connection.is_opened());

        connection_open && self.subscription.is_some()
    }

    /// Current lifecycle state, derived from the held handles
    pub fn state(&self) -> SessionState {
        if self.is_running() {
            SessionState::Running
        } else if self.connection.is_some() || self.subscription.is_some() {
            SessionState::Disconnected
        } else if self.disposed {
            SessionState::Disposed
        } else {
            SessionState::Uninitialized
        }
    }

    /// Identifier of the attached subscription, if any
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.subscription
            .as_ref()
            .map(|subscription| subscription.subscription_id())
    }

    /// Connect and subscribe; no-op while already running
    ///
    /// # Errors
    /// - `ConsumerError::Configuration` - Endpoints or address cannot be resolved
    /// - `ConsumerError::Connection` - The provider could not connect
    /// - `ConsumerError::Subscription` - The broker refused the subscription
    pub async fn create_consumer(&mut self, cancel: &CancellationToken) -> Result<(), ConsumerError> {
        if self.is_running() {
            return Ok(());
        }

        // Handles left behind by a dropped connection are released, not reused
        if self.connection.is_some() || self.subscription.is_some() {
            self.dispose().await;
        }

        let endpoints = self.configuration.resolve_endpoints()?;
        let settings = self.configuration.subscription_settings()?;

        let connection = self.provider.create(&endpoints, cancel).await?;

        let subscription = match connection.create_subscription(&settings).await {
            Ok(subscription) => subscription,
            Err(error) => {
                if let Err(dispose_error) = connection.dispose().await {
                    warn!(
                        endpoint = %self.id_endpoint,
                        error = %dispose_error,
                        "Failed to dispose connection after subscription was refused"
                    );
                }
                return Err(error);
            }
        };

        debug!(
            endpoint = %self.id_endpoint,
            subscription_id = %subscription.subscription_id(),
            queue = %settings.queue_name(),
            "Subscription attached"
        );

        self.connection = Some(connection);
        self.subscription = Some(Arc::from(subscription));
        self.disposed = false;
        Ok(())
    }

    /// Wait for one message and hand it to the handler
    ///
    /// Handler failures are returned as `ConsumerError::Handler`, not swallowed.
    pub async fn receive_message(
        &self,
        correlation_id: &CorrelationId,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError> {
        let subscription = self
            .subscription
            .as_ref()
            .map(Arc::clone)
            .ok_or(ConsumerError::NotRunning)?;

        let message = subscription.receive(cancel).await?;

        let span = info_span!(
            "handle_message",
            correlation_id = %correlation_id,
            endpoint = %self.id_endpoint,
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
        );

        let context = MessageContext::new(subscription, *correlation_id, Arc::clone(&self.id_endpoint));

        self.handler
            .handle(context, message)
            .instrument(span)
            .await
            .map_err(ConsumerError::Handler)
    }

    /// Settle `message` as processed; the broker forgets it
    pub async fn accept(&self, message: &ReceivedMessage) -> Result<(), ConsumerError> {
        self.delivery(message, DeliveryOutcome::Accept, false).await
    }

    /// Settle `message` as unprocessable; the broker dead-letters it
    pub async fn reject(&self, message: &ReceivedMessage) -> Result<(), ConsumerError> {
        self.delivery(message, DeliveryOutcome::Reject, false).await
    }

    /// Hand `message` back without counting a delivery attempt
    ///
    /// With `undeliverable_here` the broker will not offer it to this
    /// subscription again.
    pub async fn release(
        &self,
        message: &ReceivedMessage,
        undeliverable_here: bool,
    ) -> Result<(), ConsumerError> {
        self.delivery(message, DeliveryOutcome::Release, undeliverable_here)
            .await
    }

    /// Hand `message` back and increment its delivery count
    pub async fn retry(
        &self,
        message: &ReceivedMessage,
        undeliverable_here: bool,
    ) -> Result<(), ConsumerError> {
        self.delivery(message, DeliveryOutcome::Retry, undeliverable_here)
            .await
    }

    /// Settle a message produced by this session's current subscription
    ///
    /// # Errors
    /// - `ConsumerError::NotRunning` - No subscription is attached
    /// - `ConsumerError::MessageNotOwned` - The message came from another subscription
    pub async fn delivery(
        &self,
        message: &ReceivedMessage,
        outcome: DeliveryOutcome,
        undeliverable_here: bool,
    ) -> Result<(), ConsumerError> {
        let subscription = self.subscription.as_ref().ok_or(ConsumerError::NotRunning)?;
        dispatch(subscription.as_ref(), message, outcome, undeliverable_here).await
    }

    /// Settle a message with a numeric outcome code
    ///
    /// The code is validated before anything is sent to the broker.
    pub async fn delivery_code(
        &self,
        message: &ReceivedMessage,
        code: i32,
        undeliverable_here: bool,
    ) -> Result<(), ConsumerError> {
        let outcome = DeliveryOutcome::try_from(code)?;
        self.delivery(message, outcome, undeliverable_here).await
    }

    /// Release the subscription, then the connection
    ///
    /// Each release is attempted even if the other fails. Safe to call
    /// repeatedly and on a session that never connected.
    pub async fn dispose(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            if let Err(error) = subscription.dispose().await {
                warn!(
                    endpoint = %self.id_endpoint,
                    error = %error,
                    "Failed to dispose subscription"
                );
            }
            self.disposed = true;
        }

        if let Some(connection) = self.connection.take() {
            if let Err(error) = connection.dispose().await {
                warn!(
                    endpoint = %self.id_endpoint,
                    error = %error,
                    "Failed to dispose connection"
                );
            }
            self.disposed = true;
        }
    }
}

impl fmt::Debug for ConsumerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSession")
            .field("id_endpoint", &self.id_endpoint)
            .field("state", &self.state())
            .field("subscription_id", &self.subscription_id())
            .finish()
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
