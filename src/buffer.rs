//! Message buffer: per-unit-of-work staging for outbound messages.
//!
//! Entries are keyed by a stable insertion index. Adding a message for a
//! collapsible topic that is already buffered overwrites that entry in place,
//! so a flush sends only the latest payload, at the position of the first
//! insertion. Removing an entry never renumbers the others.
//!
//! A buffer belongs to exactly one unit of work and is never shared.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::destination::DestinationRegistry;
use crate::error::Result;
use crate::message::{MessageId, OutgoingMessage, Properties};
use crate::producer::Producer;

/// A staged outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedMessage {
    pub topic: String,
    pub message: OutgoingMessage,
}

impl BufferedMessage {
    pub fn body(&self) -> &serde_json::Value {
        self.message.body()
    }

    pub fn properties(&self) -> &Properties {
        self.message.get_properties()
    }
}

#[derive(Debug, Default)]
pub struct MessageBuffer {
    entries: BTreeMap<u64, BufferedMessage>,
    collapsible: HashSet<String>,
    /// Index of the live entry for each collapsible topic.
    collapsed: HashMap<String, u64>,
    next_index: u64,
}

impl MessageBuffer {
    /// A buffer in which no topic collapses.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collapsible<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collapsible: topics.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// A buffer using the collapsible flags from the topic catalog.
    pub fn for_registry(registry: &DestinationRegistry) -> Self {
        Self::with_collapsible(registry.collapsible_topics())
    }

    pub fn is_collapsible(&self, topic: &str) -> bool {
        self.collapsible.contains(topic)
    }

    /// Stage a message. Returns the index of the entry now holding it.
    pub fn add_message(&mut self, topic: &str, message: impl Into<OutgoingMessage>) -> u64 {
        let message = message.into();

        if self.is_collapsible(topic) {
            if let Some(&index) = self.collapsed.get(topic) {
                if let Some(entry) = self.entries.get_mut(&index) {
                    debug!(topic, index, "collapsing buffered message");
                    entry.message = message;
                    return index;
                }
            }
        }

        let index = self.next_index;
        self.next_index += 1;
        if self.is_collapsible(topic) {
            self.collapsed.insert(topic.to_string(), index);
        }
        self.entries.insert(
            index,
            BufferedMessage {
                topic: topic.to_string(),
                message,
            },
        );
        index
    }

    /// Staged messages in flush order, with their indexes.
    pub fn get_messages(&self) -> impl Iterator<Item = (u64, &BufferedMessage)> {
        self.entries.iter().map(|(index, entry)| (*index, entry))
    }

    pub fn get(&self, index: u64) -> Option<&BufferedMessage> {
        self.entries.get(&index)
    }

    /// Snapshot of live indexes. Safe to walk while removing entries.
    pub fn indexes(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    /// Drop one staged message. Other indexes are unaffected.
    pub fn remove_message(&mut self, index: u64) -> Option<BufferedMessage> {
        let removed = self.entries.remove(&index)?;
        if self.collapsed.get(&removed.topic) == Some(&index) {
            self.collapsed.remove(&removed.topic);
        }
        Some(removed)
    }

    pub fn has_messages_for_topic(&self, topic: &str) -> bool {
        self.entries.values().any(|e| e.topic == topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.collapsed.clear();
    }

    fn first(&self) -> Option<(u64, &BufferedMessage)> {
        self.entries.iter().next().map(|(i, e)| (*i, e))
    }
}

/// Inspects a buffer before flush and may remove entries from it.
pub trait MessageFilter: Send + Sync {
    fn apply(&self, buffer: &mut MessageBuffer);
}

impl<F> MessageFilter for F
where
    F: Fn(&mut MessageBuffer) + Send + Sync,
{
    fn apply(&self, buffer: &mut MessageBuffer) {
        self(buffer)
    }
}

/// A producer with opt-in buffering for one unit of work.
pub struct BufferedProducer {
    producer: Producer,
    buffer: MessageBuffer,
    filters: Vec<Box<dyn MessageFilter>>,
    buffering: bool,
}

impl BufferedProducer {
    /// Starts with buffering disabled.
    pub fn new(producer: Producer) -> Self {
        let buffer = MessageBuffer::for_registry(producer.registry());
        Self {
            producer,
            buffer,
            filters: Vec::new(),
            buffering: false,
        }
    }

    pub fn with_filter(mut self, filter: impl MessageFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn enable_buffering(&mut self) {
        self.buffering = true;
    }

    /// Stop buffering new sends. Already staged messages stay until flushed.
    pub fn disable_buffering(&mut self) {
        self.buffering = false;
    }

    pub fn is_buffering_enabled(&self) -> bool {
        self.buffering
    }

    /// Send or stage a message. Returns the id when sent immediately.
    ///
    /// The topic is resolved even when buffering, so unknown topics fail
    /// inside the unit of work that produced them.
    pub async fn send(
        &mut self,
        topic: &str,
        body: serde_json::Value,
        properties: Properties,
    ) -> Result<Option<MessageId>> {
        self.publish(topic, OutgoingMessage::new(body).properties(properties))
            .await
    }

    pub async fn publish(
        &mut self,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<Option<MessageId>> {
        if self.buffering {
            self.producer.registry().resolve(topic)?;
            self.buffer.add_message(topic, message);
            return Ok(None);
        }
        self.producer.publish(topic, message).await.map(Some)
    }

    /// Run the filters, then send every staged message in order.
    ///
    /// Each entry leaves the buffer only once sent; on failure the failed
    /// entry and everything after it remain staged.
    pub async fn flush(&mut self) -> Result<Vec<MessageId>> {
        for filter in &self.filters {
            filter.apply(&mut self.buffer);
        }

        let mut sent = Vec::with_capacity(self.buffer.len());
        while let Some((index, entry)) = self.buffer.first() {
            let id = self
                .producer
                .publish(&entry.topic, entry.message.clone())
                .await?;
            self.buffer.remove_message(index);
            sent.push(id);
        }
        self.buffer.clear();
        debug!(count = sent.len(), "buffer flushed");
        Ok(sent)
    }

    /// Discard staged messages without sending.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut MessageBuffer {
        &mut self.buffer
    }
}
