//! Integration tests for the message buffer and buffered producer.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use topicq::buffer::{BufferedProducer, MessageBuffer};
use topicq::destination::{DestinationRegistry, TopicEntry};
use topicq::driver::{Driver, InMemoryDriver, Session};
use topicq::message::{OutgoingMessage, Properties};
use topicq::producer::Producer;
use topicq::provision::provision_queues;
use topicq::Error;

// ---------------------------------------------------------------------------
// MessageBuffer
// ---------------------------------------------------------------------------

#[test]
fn collapsible_topic_keeps_latest_at_first_position() {
    let mut buffer = MessageBuffer::with_collapsible(["dashboard.refresh"]);
    let first = buffer.add_message("dashboard.refresh", json!({"version": 1}));
    buffer.add_message("orders.created", json!({"id": 7}));
    let again = buffer.add_message("dashboard.refresh", json!({"version": 2}));

    assert_eq!(first, again);
    let staged: Vec<(&str, &serde_json::Value)> = buffer
        .get_messages()
        .map(|(_, m)| (m.topic.as_str(), m.body()))
        .collect();
    assert_eq!(
        staged,
        vec![
            ("dashboard.refresh", &json!({"version": 2})),
            ("orders.created", &json!({"id": 7})),
        ]
    );
}

#[test]
fn non_collapsible_topic_keeps_every_message() {
    let mut buffer = MessageBuffer::new();
    buffer.add_message("orders.created", json!({"id": 1}));
    buffer.add_message("orders.created", json!({"id": 1}));
    assert_eq!(buffer.len(), 2);
    assert!(buffer.has_messages_for_topic("orders.created"));
    assert!(!buffer.has_messages_for_topic("orders.cancelled"));
}

#[test]
fn removal_keeps_other_indexes_stable() {
    let mut buffer = MessageBuffer::new();
    let a = buffer.add_message("a", json!(1));
    let b = buffer.add_message("b", json!(2));
    let c = buffer.add_message("c", json!(3));

    let removed = buffer.remove_message(b).unwrap();
    assert_eq!(removed.topic, "b");
    assert_eq!(buffer.get(a).unwrap().topic, "a");
    assert_eq!(buffer.get(c).unwrap().topic, "c");
    assert!(buffer.get(b).is_none());
    assert!(buffer.remove_message(b).is_none());
}

#[test]
fn collapsible_add_after_removal_appends() {
    let mut buffer = MessageBuffer::with_collapsible(["dashboard.refresh"]);
    let first = buffer.add_message("dashboard.refresh", json!(1));
    buffer.add_message("orders.created", json!({}));
    buffer.remove_message(first);

    let second = buffer.add_message("dashboard.refresh", json!(2));
    assert_ne!(first, second);
    assert_eq!(buffer.indexes().last(), Some(&second));
}

#[test]
fn entries_can_be_removed_while_walking_indexes() {
    let mut buffer = MessageBuffer::new();
    for n in 0..6 {
        let topic = if n % 2 == 0 { "keep" } else { "drop" };
        buffer.add_message(topic, json!(n));
    }

    for index in buffer.indexes() {
        if buffer.get(index).is_some_and(|m| m.topic == "drop") {
            buffer.remove_message(index);
        }
    }

    let bodies: Vec<&serde_json::Value> = buffer.get_messages().map(|(_, m)| m.body()).collect();
    assert_eq!(bodies, vec![&json!(0), &json!(2), &json!(4)]);
}

#[test]
fn buffer_keeps_properties() {
    let mut buffer = MessageBuffer::new();
    let index = buffer.add_message(
        "orders.created",
        OutgoingMessage::new(json!({})).property("tenant", "acme"),
    );
    let entry = buffer.get(index).unwrap();
    assert_eq!(entry.properties().get("tenant").unwrap().to_string(), "acme");
}

// ---------------------------------------------------------------------------
// BufferedProducer
// ---------------------------------------------------------------------------

async fn buffered_producer() -> (InMemoryDriver, BufferedProducer) {
    let driver = InMemoryDriver::new();
    let registry = DestinationRegistry::builder("q.")
        .topic(TopicEntry::new("orders.created").queue("q.shared"))
        .topic(TopicEntry::new("orders.cancelled").queue("q.shared"))
        .topic(
            TopicEntry::new("dashboard.refresh")
                .queue("q.shared")
                .collapsible(true),
        )
        .build()
        .unwrap();
    assert!(provision_queues(&registry, &driver, |_| {}).await.is_success());

    let producer = Producer::new(Arc::new(registry), Arc::new(driver.clone()));
    (driver, BufferedProducer::new(producer))
}

async fn drain(driver: &InMemoryDriver, queue: &str) -> Vec<(String, serde_json::Value)> {
    let session = driver.open_session().await.unwrap();
    let mut out = Vec::new();
    while let Some(msg) = session
        .receive(queue, Duration::from_millis(10))
        .await
        .unwrap()
    {
        session.acknowledge(&msg).await.unwrap();
        out.push((msg.topic.clone(), msg.body.clone()));
    }
    out
}

#[tokio::test]
async fn flush_sends_in_insertion_order_with_collapse() {
    let (driver, mut producer) = buffered_producer().await;
    producer.enable_buffering();

    let staged = producer
        .send("dashboard.refresh", json!({"v": 1}), Properties::new())
        .await
        .unwrap();
    assert!(staged.is_none());
    producer
        .send("orders.created", json!({"id": 1}), Properties::new())
        .await
        .unwrap();
    producer
        .send("dashboard.refresh", json!({"v": 2}), Properties::new())
        .await
        .unwrap();
    producer
        .send("orders.cancelled", json!({"id": 1}), Properties::new())
        .await
        .unwrap();

    assert_eq!(driver.queue_depth("q.shared"), 0);
    let ids = producer.flush().await.unwrap();
    assert_eq!(ids.len(), 3);
    assert!(producer.buffer().is_empty());

    assert_eq!(
        drain(&driver, "q.shared").await,
        vec![
            ("dashboard.refresh".to_string(), json!({"v": 2})),
            ("orders.created".to_string(), json!({"id": 1})),
            ("orders.cancelled".to_string(), json!({"id": 1})),
        ]
    );
}

#[tokio::test]
async fn buffered_send_to_unknown_topic_fails_immediately() {
    let (_, mut producer) = buffered_producer().await;
    producer.enable_buffering();

    let err = producer
        .send("orders.shipped", json!({}), Properties::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownTopic(_)));
    assert!(producer.buffer().is_empty());
}

#[tokio::test]
async fn filter_removes_entries_before_flush() {
    let (driver, producer) = buffered_producer().await;
    let mut producer = producer.with_filter(|buffer: &mut MessageBuffer| {
        for index in buffer.indexes() {
            if buffer.get(index).is_some_and(|m| m.topic == "orders.cancelled") {
                buffer.remove_message(index);
            }
        }
    });
    producer.enable_buffering();

    producer
        .send("orders.created", json!({"id": 1}), Properties::new())
        .await
        .unwrap();
    producer
        .send("orders.cancelled", json!({"id": 1}), Properties::new())
        .await
        .unwrap();
    producer.flush().await.unwrap();

    let topics: Vec<String> = drain(&driver, "q.shared")
        .await
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    assert_eq!(topics, vec!["orders.created"]);
}

#[tokio::test]
async fn unbuffered_send_goes_straight_through() {
    let (driver, mut producer) = buffered_producer().await;
    assert!(!producer.is_buffering_enabled());

    let id = producer
        .send("orders.created", json!({}), Properties::new())
        .await
        .unwrap();
    assert!(id.is_some());
    assert_eq!(driver.queue_depth("q.shared"), 1);
}

#[tokio::test]
async fn failed_flush_keeps_unsent_messages() {
    let (driver, mut producer) = buffered_producer().await;
    producer.enable_buffering();
    producer
        .send("orders.created", json!({"id": 1}), Properties::new())
        .await
        .unwrap();
    producer
        .send("orders.created", json!({"id": 2}), Properties::new())
        .await
        .unwrap();

    driver.disconnect();
    assert!(producer.flush().await.unwrap_err().is_transport());
    assert_eq!(producer.buffer().len(), 2);

    driver.reconnect();
    assert_eq!(producer.flush().await.unwrap().len(), 2);
    assert_eq!(driver.queue_depth("q.shared"), 2);
}

#[tokio::test]
async fn clear_discards_staged_messages() {
    let (driver, mut producer) = buffered_producer().await;
    producer.enable_buffering();
    producer
        .send("orders.created", json!({}), Properties::new())
        .await
        .unwrap();
    producer.clear();
    assert!(producer.flush().await.unwrap().is_empty());
    assert_eq!(driver.queue_depth("q.shared"), 0);
}
