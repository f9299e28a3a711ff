//! Common test utilities for broker-consumer integration tests
//!
//! This module provides:
//! - Tracing setup honouring `RUST_LOG`
//! - A recording message handler with scripted outcomes
//! - Configuration and polling helpers

use async_trait::async_trait;
use broker_consumer::{
    ConsumerConfiguration, DeliveryOutcome, EndpointDescriptor, Message, MessageContext,
    MessageHandler, ReceivedMessage,
};
use bytes::Bytes;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

#[allow(dead_code)]
static TRACING: Once = Once::new();

/// Install a test subscriber once per test binary
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Recording Handler
// ============================================================================

/// What the handler does with one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Reaction {
    Settle(DeliveryOutcome),
    Fail,
}

/// Handler recording every body it sees and reacting per a script
///
/// Once the script runs out every further message is accepted.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<String>>>,
    script: Arc<Mutex<Vec<Reaction>>>,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(reactions: Vec<Reaction>) -> Self {
        let handler = Self::default();
        *handler.script.lock().unwrap() = reactions.into_iter().rev().collect();
        handler
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn handled(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, context: MessageContext, message: ReceivedMessage) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push(message.body_str().unwrap_or_default().to_string());

        let reaction = self
            .script
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(Reaction::Settle(DeliveryOutcome::Accept));

        match reaction {
            Reaction::Settle(outcome) => {
                context.delivery(&message, outcome, false).await?;
                Ok(())
            }
            Reaction::Fail => anyhow::bail!("scripted handler failure"),
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Active configuration reading `address` with a short retry delay
#[allow(dead_code)]
pub fn configuration(id_endpoint: &str, address: &str, retry_time: u64) -> ConsumerConfiguration {
    let mut configuration = ConsumerConfiguration::new(id_endpoint);
    configuration.address = Some(address.to_string());
    configuration.retry_time = retry_time;
    configuration.endpoints = vec![EndpointDescriptor::new("localhost", 5672)];
    configuration
}

#[allow(dead_code)]
pub fn text(body: &str) -> Message {
    Message::new(Bytes::from(body.to_string()))
}

/// Poll `condition` until it holds, failing the test after five seconds
#[allow(dead_code)]
pub async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(reached.is_ok(), "timed out waiting for: {}", description);
}
