//! Tests for the consumer session state machine.

use super::*;
use crate::configuration::EndpointDescriptor;
use crate::connection::{MockBrokerConnection, MockBrokerSubscription, MockConnectionProvider};
use crate::message::{DeliveryTag, MessageId, Timestamp};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// ============================================================================
// Helpers
// ============================================================================

fn test_configuration() -> ConsumerConfiguration {
    let mut configuration = ConsumerConfiguration::new("orders");
    configuration.address = Some("orders.address".to_string());
    configuration.endpoints = vec![EndpointDescriptor::new("localhost", 5672)];
    configuration
}

fn received(subscription: u64, sequence: u64) -> ReceivedMessage {
    ReceivedMessage {
        message_id: MessageId::new(),
        body: Bytes::from_static(b"payload"),
        properties: HashMap::new(),
        correlation_id: None,
        delivery_tag: DeliveryTag::new(SubscriptionId::new(subscription), sequence),
        delivery_count: 0,
        received_at: Timestamp::now(),
    }
}

/// Handler counting invocations and optionally failing
#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, _context: MessageContext, _message: ReceivedMessage) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("handler exploded");
        }
        Ok(())
    }
}

/// Provider returning exactly one connection wrapping `subscription`
fn provider_with(
    subscription: MockBrokerSubscription,
    open: Arc<AtomicBool>,
) -> MockConnectionProvider {
    let mut connection = MockBrokerConnection::new();
    connection
        .expect_is_opened()
        .returning(move || open.load(Ordering::SeqCst));
    connection
        .expect_create_subscription()
        .times(1)
        .return_once(move |_| Ok(Box::new(subscription) as Box<dyn BrokerSubscription>));
    connection.expect_dispose().returning(|| Ok(()));

    let mut provider = MockConnectionProvider::new();
    provider
        .expect_create()
        .times(1)
        .return_once(move |_, _| Ok(Box::new(connection) as Box<dyn BrokerConnection>));
    provider
}

fn subscription_with_id(id: u64) -> MockBrokerSubscription {
    let mut subscription = MockBrokerSubscription::new();
    subscription
        .expect_subscription_id()
        .return_const(SubscriptionId::new(id));
    subscription
}

fn session_with(provider: MockConnectionProvider, handler: Arc<dyn MessageHandler>) -> ConsumerSession {
    ConsumerSession::new(test_configuration(), Arc::new(provider), handler)
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_new_session_is_uninitialized() {
    let session = session_with(MockConnectionProvider::new(), Arc::new(CountingHandler::default()));

    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert_eq!(session.subscription_id(), None);
    assert_eq!(session.id_endpoint(), "orders");
}

#[tokio::test]
async fn test_create_consumer_is_idempotent_while_running() {
    let mut subscription = subscription_with_id(1);
    subscription.expect_dispose().returning(|| Ok(()));
    let provider = provider_with(subscription, Arc::new(AtomicBool::new(true)));
    let mut session = session_with(provider, Arc::new(CountingHandler::default()));
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        session.create_consumer(&cancel).await.unwrap();
    }

    assert!(session.is_running());
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.subscription_id(), Some(SubscriptionId::new(1)));
}

#[tokio::test]
async fn test_is_running_follows_connection_state() {
    let open = Arc::new(AtomicBool::new(true));
    let mut subscription = subscription_with_id(1);
    subscription.expect_dispose().returning(|| Ok(()));
    let provider = provider_with(subscription, open.clone());
    let mut session = session_with(provider, Arc::new(CountingHandler::default()));

    session.create_consumer(&CancellationToken::new()).await.unwrap();
    assert!(session.is_running());

    open.store(false, Ordering::SeqCst);

    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_connection_failure_leaves_session_uninitialized() {
    let mut provider = MockConnectionProvider::new();
    provider.expect_create().times(1).returning(|_, _| {
        Err(ConsumerError::Connection {
            message: "broker unreachable".to_string(),
        })
    });
    let mut session = session_with(provider, Arc::new(CountingHandler::default()));

    let result = session.create_consumer(&CancellationToken::new()).await;

    assert!(matches!(result, Err(ConsumerError::Connection { .. })));
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn test_refused_subscription_disposes_connection() {
    let mut connection = MockBrokerConnection::new();
    connection.expect_is_opened().return_const(true);
    connection.expect_create_subscription().times(1).returning(|_| {
        Err(ConsumerError::Subscription {
            message: "address does not exist".to_string(),
        })
    });
    connection.expect_dispose().times(1).returning(|| Ok(()));

    let mut provider = MockConnectionProvider::new();
    provider
        .expect_create()
        .times(1)
        .return_once(move |_, _| Ok(Box::new(connection) as Box<dyn BrokerConnection>));
    let mut session = session_with(provider, Arc::new(CountingHandler::default()));

    let result = session.create_consumer(&CancellationToken::new()).await;

    assert!(matches!(result, Err(ConsumerError::Subscription { .. })));
    assert!(!session.is_running());
}

#[tokio::test]
async fn test_create_consumer_requires_an_address() {
    let mut configuration = test_configuration();
    configuration.address = None;
    let mut session = ConsumerSession::new(
        configuration,
        Arc::new(MockConnectionProvider::new()),
        Arc::new(CountingHandler::default()),
    );

    let result = session.create_consumer(&CancellationToken::new()).await;

    assert!(matches!(result, Err(ConsumerError::Configuration(_))));
}

// ============================================================================
// Disposal
// ============================================================================

#[tokio::test]
async fn test_dispose_on_never_created_session_is_noop() {
    let mut session = session_with(MockConnectionProvider::new(), Arc::new(CountingHandler::default()));

    session.dispose().await;
    session.dispose().await;

    assert_eq!(session.state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn test_dispose_releases_connection_when_subscription_dispose_fails() {
    let mut subscription = subscription_with_id(1);
    subscription.expect_dispose().times(1).returning(|| {
        Err(ConsumerError::Disposition {
            action: "detach".to_string(),
            message: "link already closed".to_string(),
        })
    });

    let mut connection = MockBrokerConnection::new();
    connection.expect_is_opened().return_const(true);
    connection
        .expect_create_subscription()
        .return_once(move |_| Ok(Box::new(subscription) as Box<dyn BrokerSubscription>));
    connection.expect_dispose().times(1).returning(|| Ok(()));

    let mut provider = MockConnectionProvider::new();
    provider
        .expect_create()
        .return_once(move |_, _| Ok(Box::new(connection) as Box<dyn BrokerConnection>));
    let mut session = session_with(provider, Arc::new(CountingHandler::default()));

    session.create_consumer(&CancellationToken::new()).await.unwrap();
    session.dispose().await;
    session.dispose().await;

    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Disposed);
}

#[tokio::test]
async fn test_create_after_disconnect_builds_fresh_pair() {
    let flags = Arc::new([Arc::new(AtomicBool::new(true)), Arc::new(AtomicBool::new(true))]);
    let connections = Arc::new(AtomicUsize::new(0));

    let mut provider = MockConnectionProvider::new();
    let connection_flags = flags.clone();
    let created = connections.clone();
    provider.expect_create().times(2).returning(move |_, _| {
        let index = created.fetch_add(1, Ordering::SeqCst);
        let mut subscription = subscription_with_id(index as u64 + 1);
        subscription.expect_dispose().times(1).returning(|| Ok(()));

        let mut connection = MockBrokerConnection::new();
        let state = connection_flags[index].clone();
        connection
            .expect_is_opened()
            .returning(move || state.load(Ordering::SeqCst));
        connection
            .expect_create_subscription()
            .return_once(move |_| Ok(Box::new(subscription) as Box<dyn BrokerSubscription>));
        connection.expect_dispose().times(1).returning(|| Ok(()));
        Ok(Box::new(connection) as Box<dyn BrokerConnection>)
    });

    let mut session = session_with(provider, Arc::new(CountingHandler::default()));
    let cancel = CancellationToken::new();

    session.create_consumer(&cancel).await.unwrap();
    assert_eq!(session.subscription_id(), Some(SubscriptionId::new(1)));

    // Broker drops the first connection
    flags[0].store(false, Ordering::SeqCst);
    assert_eq!(session.state(), SessionState::Disconnected);

    session.create_consumer(&cancel).await.unwrap();

    assert!(session.is_running());
    assert_eq!(session.subscription_id(), Some(SubscriptionId::new(2)));
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    session.dispose().await;
    assert_eq!(session.state(), SessionState::Disposed);
}

// ============================================================================
// Receiving
// ============================================================================

#[tokio::test]
async fn test_receive_message_requires_running_session() {
    let session = session_with(MockConnectionProvider::new(), Arc::new(CountingHandler::default()));

    let result = session
        .receive_message(&CorrelationId::new(), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(ConsumerError::NotRunning)));
}

#[tokio::test]
async fn test_receive_message_invokes_handler_once() {
    let mut subscription = subscription_with_id(1);
    subscription
        .expect_receive()
        .times(1)
        .returning(|_| Ok(received(1, 1)));
    subscription.expect_dispose().returning(|| Ok(()));
    let provider = provider_with(subscription, Arc::new(AtomicBool::new(true)));
    let handler = Arc::new(CountingHandler::default());
    let mut session = session_with(provider, handler.clone());
    let cancel = CancellationToken::new();

    session.create_consumer(&cancel).await.unwrap();
    session
        .receive_message(&CorrelationId::new(), &cancel)
        .await
        .unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_failure_is_propagated() {
    let mut subscription = subscription_with_id(1);
    subscription
        .expect_receive()
        .returning(|_| Ok(received(1, 1)));
    subscription.expect_dispose().returning(|| Ok(()));
    let provider = provider_with(subscription, Arc::new(AtomicBool::new(true)));
    let handler = Arc::new(CountingHandler {
        calls: AtomicUsize::new(0),
        fail: true,
    });
    let mut session = session_with(provider, handler.clone());
    let cancel = CancellationToken::new();

    session.create_consumer(&cancel).await.unwrap();
    let result = session.receive_message(&CorrelationId::new(), &cancel).await;

    match result {
        Err(ConsumerError::Handler(error)) => assert!(error.to_string().contains("handler exploded")),
        other => panic!("expected handler error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_handler_context_carries_correlation_and_settles() {
    let mut subscription = subscription_with_id(1);
    subscription
        .expect_receive()
        .returning(|_| Ok(received(1, 7)));
    subscription
        .expect_accept()
        .withf(|message| message.delivery_tag.sequence() == 7)
        .times(1)
        .returning(|_| Ok(()));
    subscription.expect_dispose().returning(|| Ok(()));
    let provider = provider_with(subscription, Arc::new(AtomicBool::new(true)));

    let seen = Arc::new(std::sync::Mutex::new(None));
    let sink = seen.clone();
    let handler = handler_fn(move |context: MessageContext, message: ReceivedMessage| {
        let sink = sink.clone();
        async move {
            *sink.lock().unwrap() = Some(*context.correlation_id());
            context.accept(&message).await?;
            Ok::<(), anyhow::Error>(())
        }
    });
    let mut session = session_with(provider, Arc::new(handler));
    let cancel = CancellationToken::new();
    let correlation_id = CorrelationId::new();

    session.create_consumer(&cancel).await.unwrap();
    session.receive_message(&correlation_id, &cancel).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), Some(correlation_id));
}

// ============================================================================
// Delivery
// ============================================================================

async fn running_session(subscription: MockBrokerSubscription) -> ConsumerSession {
    let provider = provider_with(subscription, Arc::new(AtomicBool::new(true)));
    let mut session = session_with(provider, Arc::new(CountingHandler::default()));
    session.create_consumer(&CancellationToken::new()).await.unwrap();
    session
}

#[tokio::test]
async fn test_retry_and_release_map_to_modify_flags() {
    let mut subscription = subscription_with_id(1);
    subscription
        .expect_modify()
        .withf(|_, increment, undeliverable| *increment && !*undeliverable)
        .times(1)
        .returning(|_, _, _| Ok(()));
    subscription
        .expect_modify()
        .withf(|_, increment, undeliverable| !*increment && *undeliverable)
        .times(1)
        .returning(|_, _, _| Ok(()));
    subscription.expect_dispose().returning(|| Ok(()));
    let session = running_session(subscription).await;
    let message = received(1, 1);

    session.retry(&message, false).await.unwrap();
    session.release(&message, true).await.unwrap();
}

#[tokio::test]
async fn test_accept_and_reject_reach_the_broker() {
    let mut subscription = subscription_with_id(1);
    subscription.expect_accept().times(1).returning(|_| Ok(()));
    subscription.expect_reject().times(1).returning(|_| Ok(()));
    subscription.expect_dispose().returning(|| Ok(()));
    let session = running_session(subscription).await;
    let message = received(1, 1);

    session.accept(&message).await.unwrap();
    session
        .delivery(&message, DeliveryOutcome::Reject, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delivery_code_maps_known_codes() {
    let mut subscription = subscription_with_id(1);
    subscription.expect_accept().times(1).returning(|_| Ok(()));
    subscription
        .expect_modify()
        .withf(|_, increment, _| *increment)
        .times(1)
        .returning(|_, _, _| Ok(()));
    subscription.expect_dispose().returning(|| Ok(()));
    let session = running_session(subscription).await;
    let message = received(1, 1);

    session.delivery_code(&message, 1, false).await.unwrap();
    session.delivery_code(&message, 4, false).await.unwrap();
}

#[tokio::test]
async fn test_delivery_code_rejects_unknown_code_without_broker_call() {
    // No accept/reject/modify expectations: any broker call would panic
    let mut subscription = subscription_with_id(1);
    subscription.expect_dispose().returning(|| Ok(()));
    let session = running_session(subscription).await;
    let message = received(1, 1);

    for code in [0, 5, -1, 42] {
        let result = session.delivery_code(&message, code, false).await;
        assert!(matches!(
            result,
            Err(ConsumerError::InvalidOutcome { value }) if value == code
        ));
    }
}

#[tokio::test]
async fn test_delivery_of_foreign_message_is_refused() {
    let mut subscription = subscription_with_id(2);
    subscription.expect_dispose().returning(|| Ok(()));
    let session = running_session(subscription).await;
    let stale = received(1, 1);

    let result = session.accept(&stale).await;

    assert!(matches!(
        result,
        Err(ConsumerError::MessageNotOwned { owner }) if owner == SubscriptionId::new(1)
    ));
}

#[tokio::test]
async fn test_delivery_without_subscription_is_not_running() {
    let session = session_with(MockConnectionProvider::new(), Arc::new(CountingHandler::default()));

    let result = session.accept(&received(1, 1)).await;

    assert!(matches!(result, Err(ConsumerError::NotRunning)));
}

#[tokio::test]
async fn test_disposition_failure_is_surfaced() {
    let mut subscription = subscription_with_id(1);
    subscription.expect_reject().returning(|_| {
        Err(ConsumerError::Disposition {
            action: "reject".to_string(),
            message: "link detached".to_string(),
        })
    });
    subscription.expect_dispose().returning(|| Ok(()));
    let session = running_session(subscription).await;

    let result = session.reject(&received(1, 1)).await;

    assert!(matches!(result, Err(ConsumerError::Disposition { .. })));
}
