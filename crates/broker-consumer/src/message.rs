//! Message types for consumer operations including core domain identifiers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Unique identifier for messages travelling through the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("message id must not be empty".to_string());
        }

        Ok(Self(s.to_string()))
    }
}

/// Identifier of one broker subscription instance
///
/// A fresh identifier is issued every time a subscription is created, so
/// messages received before a reconnect can be told apart from messages of
/// the current subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Broker handle used to settle a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    subscription_id: SubscriptionId,
    sequence: u64,
}

impl DeliveryTag {
    pub fn new(subscription_id: SubscriptionId, sequence: u64) -> Self {
        Self {
            subscription_id,
            sequence,
        }
    }

    /// Subscription that produced the delivery
    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Per-subscription delivery sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be published to the broker
#[derive(Debug, Clone)]
pub struct Message {
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    pub correlation_id: Option<String>,
}

impl Message {
    /// Create new message with body
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            properties: HashMap::new(),
            correlation_id: None,
        }
    }

    /// Add application property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A message received from a subscription, awaiting a delivery outcome
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    pub correlation_id: Option<String>,
    pub delivery_tag: DeliveryTag,
    /// Number of previous deliveries counted by the broker
    pub delivery_count: u32,
    pub received_at: Timestamp,
}

impl ReceivedMessage {
    /// Subscription this message must be settled on
    pub fn subscription_id(&self) -> SubscriptionId {
        self.delivery_tag.subscription_id()
    }

    /// Body interpreted as UTF-8 text
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Check if message has been delivered more often than `max_count`
    pub fn has_exceeded_max_delivery_count(&self, max_count: u32) -> bool {
        self.delivery_count > max_count
    }

    /// Convert back to an outgoing message (for forwarding/replaying)
    pub fn message(&self) -> Message {
        Message {
            body: self.body.clone(),
            properties: self.properties.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
