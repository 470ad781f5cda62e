//! Producer: publishes topic-addressed messages through the configured driver.
//!
//! Sends are immediate. Callers that want to coalesce messages within a unit
//! of work opt in through [`BufferedProducer`](crate::buffer::BufferedProducer).

use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::destination::DestinationRegistry;
use crate::driver::Driver;
use crate::error::Result;
use crate::message::{MessageId, OutgoingMessage, Properties};
use crate::telemetry::metrics;

/// Resolves topics through the registry and hands messages to the driver.
#[derive(Clone)]
pub struct Producer {
    registry: Arc<DestinationRegistry>,
    driver: Arc<dyn Driver>,
}

impl Producer {
    pub fn new(registry: Arc<DestinationRegistry>, driver: Arc<dyn Driver>) -> Self {
        Self { registry, driver }
    }

    /// Publish `body` with `properties` to `topic`.
    ///
    /// Fails with `UnknownTopic` if the topic was never registered, and with a
    /// transport error if the driver cannot deliver. Nothing is retried here.
    pub async fn send(
        &self,
        topic: &str,
        body: serde_json::Value,
        properties: Properties,
    ) -> Result<MessageId> {
        self.publish(topic, OutgoingMessage::new(body).properties(properties))
            .await
    }

    /// Publish a fully built message to `topic`.
    pub async fn publish(&self, topic: &str, outgoing: OutgoingMessage) -> Result<MessageId> {
        let destination = self.registry.resolve(topic)?;
        let message = outgoing.into_message(topic);
        let id = message.id;

        let result = self.driver.send(&destination.queue_name, &message).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::messages_sent().add(
            1,
            &[
                KeyValue::new("topic", topic.to_string()),
                KeyValue::new("result", outcome),
            ],
        );

        if let Err(e) = result {
            warn!(topic, queue = %destination.queue_name, error = %e, "send failed");
            return Err(e);
        }

        debug!(
            topic,
            queue = %destination.queue_name,
            message_id = %id,
            "message sent"
        );
        Ok(id)
    }

    pub fn registry(&self) -> &DestinationRegistry {
        &self.registry
    }
}
