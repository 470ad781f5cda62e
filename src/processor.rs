//! Processor contract: application-level message handlers.
//!
//! A processor declares its topic subscriptions once, at registration time,
//! and handles each delivery with a single `process` call. Any delivery may
//! land on any consumer instance, so processors must not carry state across
//! deliveries.

use async_trait::async_trait;
use thiserror::Error;

use crate::destination::TopicEntry;
use crate::driver::Session;
use crate::message::Message;

/// Outcome of processing one delivery.
///
/// Variants are ordered by precedence: combining results keeps the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessResult {
    /// Done. Remove the message from the queue.
    Ack,
    /// Try again later, possibly on another consumer.
    Requeue,
    /// The message can never succeed. Remove it without redelivery.
    Reject,
}

impl ProcessResult {
    /// Combine the results of two processors that handled the same delivery.
    ///
    /// A delivery cannot be partially acknowledged, so any non-ACK wins, and
    /// a terminal REJECT wins over REQUEUE.
    pub fn combine(self, other: ProcessResult) -> ProcessResult {
        self.max(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessResult::Ack => "ack",
            ProcessResult::Requeue => "requeue",
            ProcessResult::Reject => "reject",
        }
    }
}

impl std::fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised inside `process`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ProcessorError {
    pub reason: String,
    /// Retryable failures requeue the message; the rest reject it.
    pub retryable: bool,
}

impl ProcessorError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }

    /// The result code this failure maps to.
    pub fn result(&self) -> ProcessResult {
        if self.retryable {
            ProcessResult::Requeue
        } else {
            ProcessResult::Reject
        }
    }
}

impl From<crate::error::Error> for ProcessorError {
    fn from(e: crate::error::Error) -> Self {
        let retryable = e.is_transport();
        Self {
            reason: e.to_string(),
            retryable,
        }
    }
}

/// A malformed body will not parse on the next attempt either.
impl From<serde_json::Error> for ProcessorError {
    fn from(e: serde_json::Error) -> Self {
        Self::fatal(format!("malformed message body: {e}"))
    }
}

/// A topic a processor handles, with optional queue overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    /// Explicit physical queue instead of the prefix rule.
    pub queue: Option<String>,
    /// Require a priority-enabled queue.
    pub priority: bool,
}

impl Subscription {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            queue: None,
            priority: false,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn to_topic_entry(&self) -> TopicEntry {
        let entry = TopicEntry::new(&self.topic).priority(self.priority);
        match &self.queue {
            Some(queue) => entry.queue(queue),
            None => entry,
        }
    }
}

impl From<&str> for Subscription {
    fn from(topic: &str) -> Self {
        Self::new(topic)
    }
}

/// Application message handler.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    /// Topics this processor handles. Read once at registration.
    fn subscriptions(&self) -> Vec<Subscription>;

    /// Handle one delivery.
    async fn process(
        &self,
        message: &Message,
        session: &dyn Session,
    ) -> Result<ProcessResult, ProcessorError>;
}
