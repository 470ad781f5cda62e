//! Consumer loop for one physical queue.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use super::dispatch::dispatch;
use super::{ConsumeReport, ConsumerConfig, DeliveryOutcome, StopReason};
use crate::driver::{Driver, Session};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::processor::ProcessResult;
use crate::router::ProcessorRegistry;
use crate::telemetry::delivery::{record_state_transition, start_delivery_span};
use crate::telemetry::metrics;

/// Cooperative cancellation flag with wakeup.
#[derive(Default)]
struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.
    async fn triggered(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Receives from a queue and drives each delivery to a settlement.
///
/// Clones share the shutdown signal, so one handle can stop a loop running
/// on another task.
#[derive(Clone)]
pub struct Consumer {
    driver: Arc<dyn Driver>,
    processors: Arc<ProcessorRegistry>,
    config: ConsumerConfig,
    shutdown: Arc<ShutdownSignal>,
}

impl Consumer {
    pub fn new(
        driver: Arc<dyn Driver>,
        processors: Arc<ProcessorRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            driver,
            processors,
            config,
            shutdown: Arc::new(ShutdownSignal::default()),
        }
    }

    /// Ask the loop to stop. Takes effect between receives: a pending
    /// receive returns first, and whatever it delivered is handled with the
    /// configured grace period to finish.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Consume `queue` until shutdown or a configured limit.
    ///
    /// Returns an error only when the transport fails on receive or
    /// settlement; processing failures never end the loop.
    pub async fn run(&self, queue: &str) -> Result<ConsumeReport> {
        let session = self.driver.open_session().await?;
        let started = Instant::now();
        let mut report = ConsumeReport::default();

        info!(queue, driver = self.driver.name(), "consumer started");

        loop {
            if let Some(limit) = self.config.message_limit {
                if report.received >= limit {
                    report.stop_reason = StopReason::MessageLimit;
                    break;
                }
            }
            if let Some(limit) = self.config.time_limit {
                if started.elapsed() >= limit {
                    report.stop_reason = StopReason::TimeLimit;
                    break;
                }
            }

            // Checked only between receives: a pending receive may already have
            // claimed a delivery. `receive_timeout` bounds shutdown latency.
            if self.shutdown.is_triggered() {
                report.stop_reason = StopReason::Shutdown;
                break;
            }

            let message = match session.receive(queue, self.config.receive_timeout).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    error!(queue, error = %e, "receive failed, stopping consumer");
                    return Err(e);
                }
            };

            let outcome = self.handle(session.as_ref(), queue, message).await?;
            report.record(outcome);
        }

        info!(
            queue,
            received = report.received,
            acknowledged = report.acknowledged,
            requeued = report.requeued,
            rejected = report.rejected + report.unroutable + report.poisoned,
            stop_reason = ?report.stop_reason,
            "consumer stopped"
        );
        Ok(report)
    }

    /// Route, process and settle one delivery.
    pub async fn handle(
        &self,
        session: &dyn Session,
        queue: &str,
        message: Message,
    ) -> Result<DeliveryOutcome> {
        let attempt = message.delivery_count.max(1);
        let span = start_delivery_span(queue, &message.topic, &message.id, attempt);

        async {
            metrics::messages_received().add(1, &[KeyValue::new("queue", queue.to_string())]);

            // Deliveries can outrun the ceiling without a REQUEUE, e.g. when a
            // consumer died mid-processing and the broker redelivered.
            if attempt > self.config.max_attempts {
                return self
                    .poison(session, queue, &message, attempt, "received")
                    .await;
            }

            let processors = self.processors.processors_for(&message.topic);
            if processors.is_empty() {
                warn!(topic = %message.topic, "no processor subscribed to topic, rejecting");
                metrics::messages_unroutable()
                    .add(1, &[KeyValue::new("topic", message.topic.clone())]);
                session.reject(&message, false).await?;
                record_state_transition(&span, "received", "rejected");
                return Ok(self.observe(queue, DeliveryOutcome::Unroutable));
            }

            record_state_transition(&span, "received", "dispatched");
            let started = Instant::now();
            let mut dispatched = Box::pin(dispatch(processors, &message, session));

            let result = tokio::select! {
                result = &mut dispatched => Some(result),
                _ = self.grace_expired() => None,
            };
            drop(dispatched);

            metrics::processing_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("topic", message.topic.clone())],
            );

            let Some(result) = result else {
                warn!(
                    grace_ms = self.config.shutdown_grace.as_millis() as u64,
                    "shutdown grace period elapsed mid-processing, returning message to queue"
                );
                session.reject(&message, true).await?;
                record_state_transition(&span, "dispatched", "requeued");
                return Ok(self.observe(queue, DeliveryOutcome::Abandoned));
            };

            match result {
                ProcessResult::Ack => {
                    session.acknowledge(&message).await?;
                    record_state_transition(&span, "dispatched", "acknowledged");
                    Ok(self.observe(queue, DeliveryOutcome::Acknowledged))
                }
                ProcessResult::Reject => {
                    session.reject(&message, false).await?;
                    record_state_transition(&span, "dispatched", "rejected");
                    Ok(self.observe(queue, DeliveryOutcome::Rejected))
                }
                ProcessResult::Requeue if attempt >= self.config.max_attempts => {
                    self.poison(session, queue, &message, attempt, "dispatched")
                        .await
                }
                ProcessResult::Requeue => {
                    session.reject(&message, true).await?;
                    record_state_transition(&span, "dispatched", "requeued");
                    debug!(attempt, "message requeued");
                    Ok(self.observe(queue, DeliveryOutcome::Requeued))
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Reject without requeue a message that has used up its deliveries.
    async fn poison(
        &self,
        session: &dyn Session,
        queue: &str,
        message: &Message,
        attempts: u32,
        from: &str,
    ) -> Result<DeliveryOutcome> {
        let err = Error::PoisonMessage {
            message_id: message.id.to_string(),
            attempts,
        };
        error!(
            topic = %message.topic,
            max_attempts = self.config.max_attempts,
            error = %err,
            "delivery ceiling reached, rejecting"
        );
        metrics::messages_poisoned().add(1, &[KeyValue::new("topic", message.topic.clone())]);
        session.reject(message, false).await?;
        record_state_transition(&tracing::Span::current(), from, "rejected");
        Ok(self.observe(queue, DeliveryOutcome::Poisoned))
    }

    fn observe(&self, queue: &str, outcome: DeliveryOutcome) -> DeliveryOutcome {
        metrics::message_outcomes().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("outcome", outcome.as_str()),
            ],
        );
        outcome
    }

    /// Resolves once shutdown was requested and the grace period has passed.
    async fn grace_expired(&self) {
        self.shutdown.triggered().await;
        tokio::time::sleep(self.config.shutdown_grace).await;
    }
}
