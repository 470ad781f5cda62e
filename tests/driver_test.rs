//! Integration tests for the in-memory broker.

use serde_json::json;
use std::time::Duration;
use topicq::destination::QueueOptions;
use topicq::driver::memory::SessionEvent;
use topicq::driver::{Driver, InMemoryDriver, Session};
use topicq::message::{Message, OutgoingMessage, Priority};

const WAIT: Duration = Duration::from_millis(50);

async fn driver_with(queue: &str, options: QueueOptions) -> InMemoryDriver {
    let driver = InMemoryDriver::new();
    driver.create_queue(queue, &options).await.unwrap();
    driver
}

fn message(topic: &str, body: serde_json::Value) -> Message {
    OutgoingMessage::new(body).into_message(topic)
}

#[tokio::test]
async fn create_queue_is_idempotent() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    driver.send("q.jobs", &message("jobs", json!(1))).await.unwrap();

    driver
        .create_queue("q.jobs", &QueueOptions::default())
        .await
        .unwrap();
    assert_eq!(driver.queue_names(), vec!["q.jobs"]);
    assert_eq!(driver.queue_depth("q.jobs"), 1);
    assert_eq!(driver.queue_options("q.jobs"), Some(QueueOptions::default()));
}

#[tokio::test]
async fn send_to_undeclared_queue_fails() {
    let driver = InMemoryDriver::new();
    let err = driver
        .send("q.missing", &message("missing", json!(null)))
        .await
        .unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn receive_times_out_on_empty_queue() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    let session = driver.open_session().await.unwrap();
    let started = tokio::time::Instant::now();
    assert!(session.receive("q.jobs", WAIT).await.unwrap().is_none());
    assert!(started.elapsed() >= WAIT);
}

#[tokio::test]
async fn receive_wakes_on_send() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    let session = driver.open_session().await.unwrap();

    let sender = driver.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        sender
            .send("q.jobs", &message("jobs", json!("late")))
            .await
            .unwrap();
    });

    let msg = session
        .receive("q.jobs", Duration::from_secs(2))
        .await
        .unwrap()
        .expect("message arrives before timeout");
    assert_eq!(msg.body, json!("late"));
    assert_eq!(msg.delivery_count, 1);
    assert!(!msg.redelivered);
}

#[tokio::test]
async fn priority_queue_delivers_highest_first() {
    let options = QueueOptions {
        priority: true,
        ..QueueOptions::default()
    };
    let driver = driver_with("q.alerts", options).await;
    for (body, priority) in [(1, Priority::Low), (2, Priority::VeryHigh), (3, Priority::Normal)] {
        let msg = OutgoingMessage::new(json!(body))
            .priority(priority)
            .into_message("alerts");
        driver.send("q.alerts", &msg).await.unwrap();
    }

    let session = driver.open_session().await.unwrap();
    let mut order = Vec::new();
    while let Some(msg) = session.receive("q.alerts", WAIT).await.unwrap() {
        session.acknowledge(&msg).await.unwrap();
        order.push(msg.body);
    }
    assert_eq!(order, vec![json!(2), json!(3), json!(1)]);
}

#[tokio::test]
async fn plain_queue_ignores_priority() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    for (body, priority) in [(1, Priority::Low), (2, Priority::VeryHigh)] {
        let msg = OutgoingMessage::new(json!(body))
            .priority(priority)
            .into_message("jobs");
        driver.send("q.jobs", &msg).await.unwrap();
    }

    let session = driver.open_session().await.unwrap();
    let first = session.receive("q.jobs", WAIT).await.unwrap().unwrap();
    assert_eq!(first.body, json!(1));
}

#[tokio::test]
async fn delayed_message_is_held_back() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    let msg = OutgoingMessage::new(json!("later"))
        .delay(Duration::from_millis(100))
        .into_message("jobs");
    driver.send("q.jobs", &msg).await.unwrap();

    let session = driver.open_session().await.unwrap();
    assert!(session.receive("q.jobs", Duration::from_millis(20)).await.unwrap().is_none());
    let msg = session
        .receive("q.jobs", Duration::from_secs(2))
        .await
        .unwrap();
    assert!(msg.is_some());
}

#[tokio::test]
async fn expired_message_is_dropped() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    let msg = OutgoingMessage::new(json!("stale"))
        .expiration(Duration::from_millis(10))
        .into_message("jobs");
    driver.send("q.jobs", &msg).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let session = driver.open_session().await.unwrap();
    assert!(session.receive("q.jobs", WAIT).await.unwrap().is_none());
    assert_eq!(driver.queue_depth("q.jobs"), 0);
}

#[tokio::test]
async fn requeue_marks_redelivery() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    let sent = message("jobs", json!({"n": 1}));
    driver.send("q.jobs", &sent).await.unwrap();

    let session = driver.open_session().await.unwrap();
    let first = session.receive("q.jobs", WAIT).await.unwrap().unwrap();
    assert_eq!(first.id, sent.id);
    session.reject(&first, true).await.unwrap();

    let second = session.receive("q.jobs", WAIT).await.unwrap().unwrap();
    assert_eq!(second.id, sent.id);
    assert!(second.redelivered);
    assert_eq!(second.delivery_count, 2);
    assert_ne!(first.receipt, second.receipt);

    session.reject(&second, false).await.unwrap();
    assert_eq!(driver.dead_letters().len(), 1);
    assert_eq!(
        driver.journal(),
        vec![
            SessionEvent::Rejected {
                message_id: sent.id,
                queue: "q.jobs".to_string(),
                requeue: true,
            },
            SessionEvent::Rejected {
                message_id: sent.id,
                queue: "q.jobs".to_string(),
                requeue: false,
            },
        ]
    );
}

#[tokio::test]
async fn dropped_session_returns_unsettled_deliveries() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    driver.send("q.jobs", &message("jobs", json!(1))).await.unwrap();

    let session = driver.open_session().await.unwrap();
    let _msg = session.receive("q.jobs", WAIT).await.unwrap().unwrap();
    assert_eq!(driver.in_flight(), 1);
    assert_eq!(driver.queue_depth("q.jobs"), 0);

    drop(session);
    assert_eq!(driver.in_flight(), 0);
    assert_eq!(driver.queue_depth("q.jobs"), 1);

    let session = driver.open_session().await.unwrap();
    let again = session.receive("q.jobs", WAIT).await.unwrap().unwrap();
    assert!(again.redelivered);
}

#[tokio::test]
async fn settling_twice_fails() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    driver.send("q.jobs", &message("jobs", json!(1))).await.unwrap();

    let session = driver.open_session().await.unwrap();
    let msg = session.receive("q.jobs", WAIT).await.unwrap().unwrap();
    session.acknowledge(&msg).await.unwrap();
    assert!(session.acknowledge(&msg).await.is_err());
    assert_eq!(driver.journal().len(), 1);
}

#[tokio::test]
async fn settling_unreceived_message_fails() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    let session = driver.open_session().await.unwrap();
    assert!(session.acknowledge(&message("jobs", json!(1))).await.is_err());
}

#[tokio::test]
async fn disconnect_fails_operations_until_reconnect() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    let session = driver.open_session().await.unwrap();

    driver.disconnect();
    assert!(session.receive("q.jobs", WAIT).await.unwrap_err().is_transport());
    assert!(driver.send("q.jobs", &message("jobs", json!(1))).await.is_err());
    assert!(driver.open_session().await.is_err());

    driver.reconnect();
    driver.send("q.jobs", &message("jobs", json!(1))).await.unwrap();
    assert!(session.receive("q.jobs", WAIT).await.unwrap().is_some());
}

#[tokio::test]
async fn properties_and_headers_survive_transport() {
    let driver = driver_with("q.jobs", QueueOptions::default()).await;
    let sent = OutgoingMessage::new(json!({"id": 9}))
        .property("tenant", "acme")
        .property("retries", 2)
        .content_type("application/vnd.order+json")
        .into_message("jobs");
    driver.send("q.jobs", &sent).await.unwrap();

    let session = driver.open_session().await.unwrap();
    let got = session.receive("q.jobs", WAIT).await.unwrap().unwrap();
    assert_eq!(got.topic, "jobs");
    assert_eq!(got.properties, sent.properties);
    assert_eq!(got.headers.content_type, "application/vnd.order+json");
    assert_eq!(got.receipt().unwrap().queue, "q.jobs");
}

#[tokio::test]
async fn settlement_history_keeps_most_recent_entries() {
    let driver = InMemoryDriver::with_history_limit(2);
    driver
        .create_queue("q.jobs", &QueueOptions::default())
        .await
        .unwrap();
    let sent: Vec<Message> = (0..3).map(|n| message("jobs", json!(n))).collect();
    for msg in &sent {
        driver.send("q.jobs", msg).await.unwrap();
    }

    let session = driver.open_session().await.unwrap();
    while let Some(msg) = session.receive("q.jobs", WAIT).await.unwrap() {
        session.reject(&msg, false).await.unwrap();
    }

    let journal: Vec<_> = driver
        .journal()
        .into_iter()
        .map(|event| match event {
            SessionEvent::Rejected { message_id, .. } => message_id,
            SessionEvent::Acknowledged { message_id, .. } => message_id,
        })
        .collect();
    assert_eq!(journal, vec![sent[1].id, sent[2].id]);

    let buried: Vec<_> = driver.dead_letters().into_iter().map(|m| m.id).collect();
    assert_eq!(buried, vec![sent[1].id, sent[2].id]);
}
