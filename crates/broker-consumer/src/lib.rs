//! # Broker Consumer
//!
//! Supervised message consumption from AMQP-style brokers.
//!
//! This library provides:
//! - A consumer session owning one connection and one subscription
//! - A supervising loop that reconnects after failures and stops on cancellation
//! - Delivery outcomes (accept, reject, release, retry) with stable numeric codes
//! - Per-message correlation identifiers on every log line
//! - Configuration binding from `amqp.<id_endpoint>` sections
//! - An in-memory broker for tests and local development
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all consumer operations
//! - [`message`] - Message structures and delivery tags
//! - [`outcome`] - Delivery outcomes
//! - [`configuration`] - Consumer configuration and endpoints
//! - [`connection`] - Broker collaborator traits
//! - [`correlation`] - Correlation identifiers
//! - [`logging`] - Structured consumer logging
//! - [`session`] - Consumer session state machine and message handlers
//! - [`worker`] - Supervising loop, builder and host
//! - [`providers`] - Connection provider implementations
//!
//! ## Example
//!
//! ```rust,no_run
//! use broker_consumer::providers::InMemoryBroker;
//! use broker_consumer::{handler_fn, ConsumerConfiguration, ConsumerWorker, EndpointDescriptor};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let mut configuration = ConsumerConfiguration::new("orders");
//! configuration.address = Some("orders".to_string());
//! configuration.endpoints = vec![EndpointDescriptor::new("localhost", 5672)];
//!
//! let broker = InMemoryBroker::new();
//! let handler = handler_fn(|context, message| async move {
//!     context.accept(&message).await?;
//!     Ok::<(), anyhow::Error>(())
//! });
//!
//! let cancel = CancellationToken::new();
//! let worker = ConsumerWorker::builder(
//!     configuration,
//!     Arc::new(broker.connection_provider("orders")),
//!     Arc::new(handler),
//! )
//! .build()
//! .spawn(cancel.clone());
//!
//! cancel.cancel();
//! let _ = worker.await;
//! # }
//! ```

// Module declarations
pub mod configuration;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod logging;
pub mod message;
pub mod outcome;
pub mod providers;
pub mod session;
pub mod worker;

// Re-export commonly used types at crate root for convenience
pub use configuration::{
    ConsumerConfiguration, Endpoint, EndpointDescriptor, RoutingType, SubscriptionSettings,
    CONFIGURATION_SECTION,
};
pub use connection::{BrokerConnection, BrokerSubscription, ConnectionProvider, ConnectionProviderExt};
pub use correlation::{CorrelationContext, CorrelationId};
pub use error::{ConfigurationError, ConsumerError};
pub use logging::{ConsumerLogger, TracingConsumerLogger};
pub use message::{DeliveryTag, Message, MessageId, ReceivedMessage, SubscriptionId, Timestamp};
pub use outcome::DeliveryOutcome;
pub use session::{handler_fn, ConsumerSession, HandlerFn, MessageContext, MessageHandler, SessionState};
pub use worker::{ConsumerHost, ConsumerWorker, ConsumerWorkerBuilder, RunningHost};
