//! Metric instrument factories for topicq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("topicq")
}

/// Counter: messages handed to a driver by the producer.
/// Labels: `topic`, `result` ("ok" | "error").
pub fn messages_sent() -> Counter<u64> {
    meter()
        .u64_counter("topicq.messages.sent")
        .with_description("Messages published by producers")
        .build()
}

/// Counter: deliveries received by consumers.
/// Labels: `queue`.
pub fn messages_received() -> Counter<u64> {
    meter()
        .u64_counter("topicq.messages.received")
        .with_description("Deliveries received by consumers")
        .build()
}

/// Counter: how deliveries were settled.
/// Labels: `queue`, `outcome`.
pub fn message_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("topicq.messages.outcome")
        .with_description("Delivery settlements by outcome")
        .build()
}

/// Counter: deliveries whose topic has no subscribed processor.
/// Labels: `topic`.
pub fn messages_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("topicq.messages.unroutable")
        .with_description("Deliveries with no matching processor")
        .build()
}

/// Counter: deliveries rejected by the poison-message guard.
/// Labels: `topic`.
pub fn messages_poisoned() -> Counter<u64> {
    meter()
        .u64_counter("topicq.messages.poisoned")
        .with_description("Deliveries that exhausted their attempts")
        .build()
}

/// Counter: broker-level operations (create, send, read, delete, archive, requeue).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("topicq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: time spent in processors per delivery.
/// Labels: `topic`.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("topicq.processing.duration_ms")
        .with_description("Processor time per delivery in milliseconds")
        .with_unit("ms")
        .build()
}
