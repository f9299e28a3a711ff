//! Broker collaborator traits.
//!
//! The wire protocol lives behind these traits: a [`ConnectionProvider`]
//! turns endpoints into a [`BrokerConnection`], which hands out
//! [`BrokerSubscription`]s. Implementations own reconnection policy,
//! credentials and TLS.

use crate::configuration::{Endpoint, SubscriptionSettings};
use crate::error::ConsumerError;
use crate::message::{ReceivedMessage, SubscriptionId};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

/// Creates live broker connections from a list of endpoints
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Connect to one of `endpoints`; failover order is up to the provider
    async fn create(
        &self,
        endpoints: &[Endpoint],
        cancel: &CancellationToken,
    ) -> Result<Box<dyn BrokerConnection>, ConsumerError>;
}

/// Convenience helpers over [`ConnectionProvider`]
#[async_trait]
pub trait ConnectionProviderExt: ConnectionProvider {
    /// Connect to a single endpoint
    async fn create_single(
        &self,
        endpoint: Endpoint,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn BrokerConnection>, ConsumerError> {
        self.create(std::slice::from_ref(&endpoint), cancel).await
    }

    /// Connect without a cancellation signal
    async fn create_uncancellable(
        &self,
        endpoints: &[Endpoint],
    ) -> Result<Box<dyn BrokerConnection>, ConsumerError> {
        self.create(endpoints, &CancellationToken::new()).await
    }
}

impl<T: ConnectionProvider + ?Sized> ConnectionProviderExt for T {}

/// An open connection to the broker
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Request a subscription; fails with `ConsumerError::Subscription` when refused
    async fn create_subscription(
        &self,
        settings: &SubscriptionSettings,
    ) -> Result<Box<dyn BrokerSubscription>, ConsumerError>;

    /// Whether the connection is currently open; may change at any time
    fn is_opened(&self) -> bool;

    /// Close the connection and release its resources
    async fn dispose(&self) -> Result<(), ConsumerError>;
}

/// A subscription delivering messages from one address/queue
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerSubscription: Send + Sync {
    /// Identifier stamped on every message this subscription delivers
    fn subscription_id(&self) -> SubscriptionId;

    /// Wait for the next message; returns `ConsumerError::Cancelled` when
    /// `cancel` fires first
    async fn receive(&self, cancel: &CancellationToken) -> Result<ReceivedMessage, ConsumerError>;

    /// Acknowledge the message
    async fn accept(&self, message: &ReceivedMessage) -> Result<(), ConsumerError>;

    /// Mark the message as unprocessable
    fn reject(&self, message: &ReceivedMessage) -> Result<(), ConsumerError>;

    /// Hand the message back for redelivery
    fn modify(
        &self,
        message: &ReceivedMessage,
        increment_delivery_count: bool,
        undeliverable_here: bool,
    ) -> Result<(), ConsumerError>;

    /// Detach the subscription
    async fn dispose(&self) -> Result<(), ConsumerError>;
}
