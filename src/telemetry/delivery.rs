//! Delivery span helpers.
//!
//! One span per delivery, carrying the queue, topic, message id and attempt.
//! State transitions are recorded as events inside it.

use tracing::Span;

use crate::message::MessageId;

/// Start a span for processing one delivery.
pub fn start_delivery_span(queue: &str, topic: &str, message_id: &MessageId, attempt: u32) -> Span {
    tracing::info_span!(
        "message.deliver",
        "messaging.destination.name" = queue,
        "messaging.topic" = topic,
        "messaging.message.id" = %message_id,
        "messaging.delivery.attempt" = attempt,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
