//! Error types for consumer operations.

use crate::message::SubscriptionId;
use thiserror::Error;

/// Comprehensive error type for all consumer and broker operations
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Subscription rejected by broker: {message}")]
    Subscription { message: String },

    #[error("Receive failed: {message}")]
    Receive { message: String },

    #[error("Delivery action '{action}' failed: {message}")]
    Disposition { action: String, message: String },

    #[error("Message handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    #[error("Delivery outcome value {value} is not valid")]
    InvalidOutcome { value: i32 },

    #[error("Delivery outcome name '{name}' is not valid")]
    UnknownOutcome { name: String },

    #[error("Message belongs to subscription {owner}, not to the active subscription")]
    MessageNotOwned { owner: SubscriptionId },

    #[error("Consumer is not running")]
    NotRunning,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl ConsumerError {
    /// Check if error is transient, i.e. rebuilding the consumer may fix it
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Subscription { .. } => true, // Broker cannot tell us whether this is permanent
            Self::Receive { .. } => true,
            Self::Disposition { .. } => true,
            Self::Handler(_) => true,
            Self::InvalidOutcome { .. } => false,
            Self::UnknownOutcome { .. } => false,
            Self::MessageNotOwned { .. } => false,
            Self::NotRunning => true,
            Self::Cancelled => false,
            Self::Configuration(_) => false,
        }
    }

    /// Check if error signals cooperative cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Wrap an application handler failure
    pub fn handler(error: impl Into<anyhow::Error>) -> Self {
        Self::Handler(error.into())
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Consumer configuration for endpoint {id_endpoint} not found")]
    NotFound { id_endpoint: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
