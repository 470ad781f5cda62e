//! # topicq
//!
//! Transport-agnostic message queue client and consumption framework.
//!
//! Producers publish to logical topics; the destination registry maps each
//! topic to a physical queue; a pluggable [`driver::Driver`] talks to the
//! broker (in-memory or Postgres/pgmq). Consumers route deliveries to
//! topic-subscribed [`processor::Processor`]s and settle them with
//! at-least-once semantics, retry and a poison-message guard.

pub mod buffer;
pub mod config;
pub mod consumer;
pub mod destination;
pub mod driver;
pub mod error;
pub mod message;
pub mod processor;
pub mod producer;
pub mod provision;
pub mod router;
pub mod telemetry;

pub use buffer::{BufferedProducer, MessageBuffer, MessageFilter};
pub use consumer::{ConsumeReport, Consumer, ConsumerConfig, DeliveryOutcome};
pub use destination::{Destination, DestinationRegistry, QueueOptions, TopicEntry};
pub use driver::{Driver, InMemoryDriver, PgmqDriver, Session};
pub use error::{Error, Result};
pub use message::{Message, MessageId, OutgoingMessage, Priority, Properties, PropertyValue};
pub use processor::{ProcessResult, Processor, ProcessorError, Subscription};
pub use producer::Producer;
pub use provision::{ProvisionReport, provision_queues};
pub use router::ProcessorRegistry;
