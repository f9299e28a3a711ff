//! Tests for message types.

use super::*;

fn received(body: &str, delivery_count: u32) -> ReceivedMessage {
    ReceivedMessage {
        message_id: MessageId::new(),
        body: Bytes::from(body.to_string()),
        properties: HashMap::new(),
        correlation_id: Some("corr-1".to_string()),
        delivery_tag: DeliveryTag::new(SubscriptionId::new(7), 1),
        delivery_count,
        received_at: Timestamp::now(),
    }
}

#[test]
fn test_message_id_generation() {
    let id1 = MessageId::new();
    let id2 = MessageId::new();
    assert_ne!(id1, id2);
    assert!(!id1.as_str().is_empty());
}

#[test]
fn test_message_id_parse_rejects_empty() {
    assert!("".parse::<MessageId>().is_err());
    assert_eq!("abc".parse::<MessageId>().unwrap().as_str(), "abc");
}

#[test]
fn test_message_builder() {
    let message = Message::new("payload".into())
        .with_property("tenant", "acme")
        .with_correlation_id("corr-123");

    assert_eq!(message.properties.get("tenant"), Some(&"acme".to_string()));
    assert_eq!(message.correlation_id, Some("corr-123".to_string()));
}

#[test]
fn test_received_message_knows_its_subscription() {
    let message = received("hello", 0);

    assert_eq!(message.subscription_id(), SubscriptionId::new(7));
    assert_eq!(message.delivery_tag.sequence(), 1);
    assert_eq!(message.body_str(), Some("hello"));
}

#[test]
fn test_delivery_count_threshold() {
    assert!(!received("x", 3).has_exceeded_max_delivery_count(3));
    assert!(received("x", 4).has_exceeded_max_delivery_count(3));
}

#[test]
fn test_forwarding_keeps_body_and_properties() {
    let mut message = received("forward me", 2);
    message
        .properties
        .insert("kind".to_string(), "order".to_string());

    let outgoing = message.message();

    assert_eq!(outgoing.body, Bytes::from("forward me"));
    assert_eq!(outgoing.properties.get("kind"), Some(&"order".to_string()));
    assert_eq!(outgoing.correlation_id, Some("corr-1".to_string()));
}

#[test]
fn test_subscription_id_display() {
    assert_eq!(SubscriptionId::new(42).to_string(), "sub-42");
}
