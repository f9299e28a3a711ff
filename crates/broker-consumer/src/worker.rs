//! # Consumer Worker Module
//!
//! Long-running supervising loop that keeps one [`ConsumerSession`] alive
//! until shutdown is requested.
//!
//! Each pass of the outer loop:
//!
//! 1. creates the consumer (no-op while it is already running)
//! 2. receives and handles messages while the session is running
//! 3. disposes the session on every exit path of step 2
//! 4. on failure, logs the error and waits `retry_time` milliseconds
//!
//! The loop never propagates an error; only cancellation ends it. Both the
//! receive wait and the retry delay observe the cancellation token, so
//! shutdown does not have to sit out a full retry delay.

use crate::configuration::ConsumerConfiguration;
use crate::connection::ConnectionProvider;
use crate::correlation::CorrelationContext;
use crate::error::{ConfigurationError, ConsumerError};
use crate::logging::{ConsumerLogger, TracingConsumerLogger};
use crate::session::{ConsumerSession, MessageHandler};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Worker
// ============================================================================

/// Supervising loop around one consumer session
pub struct ConsumerWorker {
    session: ConsumerSession,
    logger: Arc<dyn ConsumerLogger>,
    correlation: CorrelationContext,
}

impl ConsumerWorker {
    /// Wrap `session`; prefer [`ConsumerWorker::builder`]
    pub fn new(session: ConsumerSession, logger: Arc<dyn ConsumerLogger>) -> Self {
        Self {
            session,
            logger,
            correlation: CorrelationContext::new(),
        }
    }

    pub fn builder(
        configuration: ConsumerConfiguration,
        provider: Arc<dyn ConnectionProvider>,
        handler: Arc<dyn MessageHandler>,
    ) -> ConsumerWorkerBuilder {
        ConsumerWorkerBuilder::new(configuration, provider, handler)
    }

    /// The supervised session
    pub fn session(&self) -> &ConsumerSession {
        &self.session
    }

    pub fn id_endpoint(&self) -> &str {
        self.session.id_endpoint()
    }

    /// Correlation identifiers minted by this worker so far
    pub fn correlation_ids_minted(&self) -> u64 {
        self.correlation.minted()
    }

    /// Run the loop on the tokio runtime; the handle yields the worker back
    /// once it has terminated
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<ConsumerWorker> {
        tokio::spawn(async move {
            self.run(&cancel).await;
            self
        })
    }

    /// Supervise the session until `cancel` fires
    ///
    /// A fresh correlation identifier is minted on entry, so a worker handed
    /// back by [`spawn`](Self::spawn) and run again never reuses a stale one.
    pub async fn run(&mut self, cancel: &CancellationToken) {
        let id_endpoint = self.session.id_endpoint().to_string();
        self.correlation.renew();

        if !self.session.is_active() {
            self.logger.info(
                self.correlation.current(),
                &id_endpoint,
                "Consumer is not active",
            );
            return;
        }

        let retry_time = self.session.retry_time();
        let retry_delay = self.session.retry_delay();

        self.logger.info(
            self.correlation.current(),
            &id_endpoint,
            "Consumer worker started",
        );

        while !cancel.is_cancelled() {
            match self.session.create_consumer(cancel).await {
                Ok(()) => {
                    self.logger.info(
                        self.correlation.current(),
                        &id_endpoint,
                        "Consumer created",
                    );

                    let result = self.consume(cancel).await;

                    // Released on every exit path, error or not
                    self.session.dispose().await;

                    if let Err(error) = result {
                        self.recover(&error, &id_endpoint, retry_time, retry_delay, cancel)
                            .await;
                    }
                }
                Err(error) => {
                    self.recover(&error, &id_endpoint, retry_time, retry_delay, cancel)
                        .await;
                }
            }

            self.logger.trace(
                self.correlation.current(),
                &id_endpoint,
                "Consumer worker pass finished",
            );

            // A session that reports "not running" right after creation would
            // otherwise spin without ever reaching an await point
            tokio::task::yield_now().await;
        }

        self.session.dispose().await;
        self.logger.info(
            self.correlation.current(),
            &id_endpoint,
            "Consumer worker is terminated",
        );
    }

    /// Receive messages while the session is running
    async fn consume(&mut self, cancel: &CancellationToken) -> Result<(), ConsumerError> {
        while !cancel.is_cancelled() && self.session.is_running() {
            self.session
                .receive_message(self.correlation.current(), cancel)
                .await?;
            self.correlation.renew();
        }

        if !cancel.is_cancelled() {
            self.logger.info(
                self.correlation.current(),
                self.session.id_endpoint(),
                "Consumer is no longer running",
            );
        }

        Ok(())
    }

    /// Log a failed pass and wait before the next one
    async fn recover(
        &self,
        error: &ConsumerError,
        id_endpoint: &str,
        retry_time: u64,
        retry_delay: Duration,
        cancel: &CancellationToken,
    ) {
        if error.is_cancelled() && cancel.is_cancelled() {
            self.logger.trace(
                self.correlation.current(),
                id_endpoint,
                "Consumer interrupted by shutdown",
            );
            return;
        }

        self.logger.error(self.correlation.current(), id_endpoint, error);
        self.logger.trace(
            self.correlation.current(),
            id_endpoint,
            &format!("Retry on {}", retry_time),
        );

        tokio::select! {
            _ = tokio::time::sleep(retry_delay) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder wiring configuration, provider, handler and logger into a worker
pub struct ConsumerWorkerBuilder {
    configuration: ConsumerConfiguration,
    provider: Arc<dyn ConnectionProvider>,
    handler: Arc<dyn MessageHandler>,
    logger: Arc<dyn ConsumerLogger>,
}

impl ConsumerWorkerBuilder {
    pub fn new(
        configuration: ConsumerConfiguration,
        provider: Arc<dyn ConnectionProvider>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            configuration,
            provider,
            handler,
            logger: Arc::new(TracingConsumerLogger),
        }
    }

    /// Bind the `amqp.<id_endpoint>` section of `config`
    ///
    /// # Errors
    /// - `ConfigurationError::NotFound` - No section exists for `id_endpoint`
    /// - `ConfigurationError::Parsing` - The section cannot be deserialized
    pub fn from_config(
        config: &config::Config,
        id_endpoint: &str,
        provider: Arc<dyn ConnectionProvider>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, ConfigurationError> {
        let configuration = ConsumerConfiguration::from_config(config, id_endpoint)?;
        Ok(Self::new(configuration, provider, handler))
    }

    /// Replace the default `tracing` logger
    pub fn logger(mut self, logger: Arc<dyn ConsumerLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn configuration(&self) -> &ConsumerConfiguration {
        &self.configuration
    }

    /// Assemble the session and its supervising worker
    pub fn build(self) -> ConsumerWorker {
        let session = ConsumerSession::new(self.configuration, self.provider, self.handler);
        ConsumerWorker::new(session, self.logger)
    }
}

// ============================================================================
// Host
// ============================================================================

/// Set of workers started and stopped together
#[derive(Default)]
pub struct ConsumerHost {
    workers: Vec<ConsumerWorker>,
}

impl ConsumerHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker; endpoint identifiers must be unique within a host
    pub fn add(&mut self, worker: ConsumerWorker) -> Result<(), ConfigurationError> {
        if self
            .workers
            .iter()
            .any(|existing| existing.id_endpoint() == worker.id_endpoint())
        {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "A consumer for endpoint {} is already registered",
                    worker.id_endpoint()
                ),
            });
        }

        self.workers.push(worker);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Endpoint identifiers of the registered workers
    pub fn id_endpoints(&self) -> HashSet<String> {
        self.workers
            .iter()
            .map(|worker| worker.id_endpoint().to_string())
            .collect()
    }

    /// Spawn every worker under a child of `cancel`
    pub fn start(self, cancel: &CancellationToken) -> RunningHost {
        let token = cancel.child_token();
        let handles = self
            .workers
            .into_iter()
            .map(|worker| worker.spawn(token.clone()))
            .collect();

        RunningHost { token, handles }
    }
}

/// Workers spawned by [`ConsumerHost::start`]
pub struct RunningHost {
    token: CancellationToken,
    handles: Vec<JoinHandle<ConsumerWorker>>,
}

impl RunningHost {
    /// Cancel every worker and wait for all of them to terminate
    pub async fn shutdown(self) -> Vec<ConsumerWorker> {
        self.token.cancel();

        let mut workers = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(worker) => workers.push(worker),
                Err(error) => tracing::error!(error = %error, "Consumer worker task failed"),
            }
        }
        workers
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
