//! Structured consumer logging.
//!
//! Every line the supervising loop emits is tagged with the correlation
//! identifier of the current processing attempt and the endpoint identifier
//! of the consumer.

use crate::correlation::CorrelationId;
use crate::error::ConsumerError;
use tracing::{error, info, trace};

/// Sink for consumer lifecycle log lines
pub trait ConsumerLogger: Send + Sync {
    fn trace(&self, correlation_id: &CorrelationId, id_endpoint: &str, message: &str);

    fn info(&self, correlation_id: &CorrelationId, id_endpoint: &str, message: &str);

    fn error(&self, correlation_id: &CorrelationId, id_endpoint: &str, error: &ConsumerError);
}

/// Default logger forwarding to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingConsumerLogger;

impl ConsumerLogger for TracingConsumerLogger {
    fn trace(&self, correlation_id: &CorrelationId, id_endpoint: &str, message: &str) {
        trace!(
            correlation_id = %correlation_id,
            endpoint = %id_endpoint,
            "{}",
            message
        );
    }

    fn info(&self, correlation_id: &CorrelationId, id_endpoint: &str, message: &str) {
        info!(
            correlation_id = %correlation_id,
            endpoint = %id_endpoint,
            "{}",
            message
        );
    }

    fn error(&self, correlation_id: &CorrelationId, id_endpoint: &str, error: &ConsumerError) {
        error!(
            correlation_id = %correlation_id,
            endpoint = %id_endpoint,
            error = %error,
            transient = error.is_transient(),
            "{:?}",
            error
        );
    }
}

#[cfg(test)]
#[path = "logging_tests.rs"]
mod tests;
