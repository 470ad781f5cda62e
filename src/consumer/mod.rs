//! Consumption runtime: receive, route, process, settle.
//!
//! Per delivery the state machine is `received → dispatched → {acknowledged,
//! rejected, requeued}`. A requeued message comes back as a new delivery,
//! possibly on another consumer, with the transport's delivery count bumped.

mod dispatch;
pub mod runtime;

pub use runtime::Consumer;

use crate::config::Config;
use std::time::Duration;

/// Configuration for a consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// How long a single `receive` blocks before the loop re-checks for shutdown.
    pub receive_timeout: Duration,
    /// Maximum deliveries of one message. A REQUEUE on the last allowed
    /// delivery becomes a terminal reject.
    pub max_attempts: u32,
    /// How long an in-flight delivery may keep running after shutdown is
    /// requested before it is returned to the queue.
    pub shutdown_grace: Duration,
    /// Stop after this many deliveries.
    pub message_limit: Option<u64>,
    /// Stop after running this long.
    pub time_limit: Option<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(1),
            max_attempts: 5,
            shutdown_grace: Duration::from_secs(10),
            message_limit: None,
            time_limit: None,
        }
    }
}

impl From<&Config> for ConsumerConfig {
    fn from(config: &Config) -> Self {
        Self {
            receive_timeout: config.receive_timeout,
            max_attempts: config.max_attempts,
            shutdown_grace: config.shutdown_grace,
            ..Self::default()
        }
    }
}

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    Acknowledged,
    /// Rejected without requeue on a processor's request.
    Rejected,
    Requeued,
    /// No processor subscribed to the topic; rejected without requeue.
    Unroutable,
    /// Delivery ceiling reached; rejected without requeue.
    Poisoned,
    /// Shutdown grace period elapsed mid-processing; returned to the queue.
    Abandoned,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::Acknowledged => "acknowledged",
            DeliveryOutcome::Rejected => "rejected",
            DeliveryOutcome::Requeued => "requeued",
            DeliveryOutcome::Unroutable => "unroutable",
            DeliveryOutcome::Poisoned => "poisoned",
            DeliveryOutcome::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a consumer loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    Shutdown,
    MessageLimit,
    TimeLimit,
}

/// Tally of one consumer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub received: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub unroutable: u64,
    pub poisoned: u64,
    pub abandoned: u64,
    pub stop_reason: StopReason,
}

impl ConsumeReport {
    pub fn record(&mut self, outcome: DeliveryOutcome) {
        self.received += 1;
        let counter = match outcome {
            DeliveryOutcome::Acknowledged => &mut self.acknowledged,
            DeliveryOutcome::Rejected => &mut self.rejected,
            DeliveryOutcome::Requeued => &mut self.requeued,
            DeliveryOutcome::Unroutable => &mut self.unroutable,
            DeliveryOutcome::Poisoned => &mut self.poisoned,
            DeliveryOutcome::Abandoned => &mut self.abandoned,
        };
        *counter += 1;
    }
}
