//! Destination metadata registry.
//!
//! Maps logical topic names to physical queues. Built once at startup from
//! the topic catalog plus processor subscriptions, then read-only.
//!
//! The topic→queue rule is a pure function of the configured prefix, so
//! producers and consumers started independently agree on the physical queue
//! without sharing any runtime state.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Namespace prepended to topic names when no explicit queue is given.
pub const DEFAULT_QUEUE_PREFIX: &str = "q.";

/// Derive the physical queue name for a topic.
pub fn queue_name_for(prefix: &str, topic: &str) -> String {
    format!("{prefix}{topic}")
}

/// Per-queue settings passed to the driver when declaring a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    /// Deliver higher-priority messages first.
    pub priority: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            priority: false,
        }
    }
}

impl QueueOptions {
    /// Combine settings from two declarations of the same queue.
    fn merge(self, other: QueueOptions) -> QueueOptions {
        QueueOptions {
            durable: self.durable && other.durable,
            exclusive: self.exclusive || other.exclusive,
            priority: self.priority || other.priority,
        }
    }
}

/// A topic resolved to its physical queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub topic_name: String,
    pub queue_name: String,
    pub queue_options: QueueOptions,
}

// ---------------------------------------------------------------------------
// Topic declarations
// ---------------------------------------------------------------------------

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct TopicCatalog {
    #[serde(default)]
    topic: Vec<TopicEntry>,
}

/// One declared topic, either from the catalog file or from a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicEntry {
    pub name: String,
    /// Explicit physical queue. Overrides the prefix rule.
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub priority: bool,
    /// Buffered sends for this topic collapse to the latest payload.
    #[serde(default)]
    pub collapsible: bool,
}

fn default_durable() -> bool {
    true
}

impl TopicEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: None,
            durable: true,
            exclusive: false,
            priority: false,
            collapsible: false,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn collapsible(mut self, collapsible: bool) -> Self {
        self.collapsible = collapsible;
        self
    }

    fn options(&self) -> QueueOptions {
        QueueOptions {
            durable: self.durable,
            exclusive: self.exclusive,
            priority: self.priority,
        }
    }
}

#[derive(Debug)]
struct TopicDecl {
    queue: Option<String>,
    options: QueueOptions,
    collapsible: bool,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects topic declarations. Declaring the same topic twice merges the
/// declarations; two different explicit queues for one topic is an error.
#[derive(Debug)]
pub struct DestinationRegistryBuilder {
    prefix: String,
    topics: BTreeMap<String, TopicDecl>,
    conflicts: Vec<String>,
}

impl DestinationRegistryBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            topics: BTreeMap::new(),
            conflicts: Vec::new(),
        }
    }

    /// Declare a topic.
    pub fn topic(mut self, entry: TopicEntry) -> Self {
        self.declare(entry);
        self
    }

    /// Declare a topic through a mutable reference.
    pub fn declare(&mut self, entry: TopicEntry) {
        let options = entry.options();
        match self.topics.get_mut(&entry.name) {
            Some(existing) => {
                match (&existing.queue, &entry.queue) {
                    (Some(a), Some(b)) if a != b => {
                        self.conflicts.push(format!(
                            "topic {} declared with queues {a} and {b}",
                            entry.name
                        ));
                    }
                    (None, Some(b)) => existing.queue = Some(b.clone()),
                    _ => {}
                }
                existing.options = existing.options.merge(options);
                existing.collapsible |= entry.collapsible;
            }
            None => {
                self.topics.insert(
                    entry.name,
                    TopicDecl {
                        queue: entry.queue,
                        options,
                        collapsible: entry.collapsible,
                    },
                );
            }
        }
    }

    /// Parse a TOML topic catalog and declare every topic in it.
    pub fn catalog_str(mut self, content: &str) -> Result<Self> {
        let catalog: TopicCatalog = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad topic catalog: {e}")))?;
        for entry in catalog.topic {
            self.declare(entry);
        }
        Ok(self)
    }

    /// Load a TOML topic catalog from disk.
    pub fn load_catalog(self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read topic catalog {}: {e}", path.display()))
        })?;
        self.catalog_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn build(self) -> Result<DestinationRegistry> {
        if !self.conflicts.is_empty() {
            return Err(Error::Config(self.conflicts.join("; ")));
        }

        let mut destinations = BTreeMap::new();
        let mut collapsible = BTreeSet::new();

        for (topic, decl) in self.topics {
            if topic.trim().is_empty() {
                return Err(Error::Config("topic name must not be empty".to_string()));
            }
            let queue_name = decl
                .queue
                .unwrap_or_else(|| queue_name_for(&self.prefix, &topic));
            if decl.collapsible {
                collapsible.insert(topic.clone());
            }
            destinations.insert(
                topic.clone(),
                Destination {
                    topic_name: topic,
                    queue_name,
                    queue_options: decl.options,
                },
            );
        }

        Ok(DestinationRegistry {
            prefix: self.prefix,
            destinations,
            collapsible,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Read-only topic→destination mapping.
#[derive(Debug)]
pub struct DestinationRegistry {
    prefix: String,
    destinations: BTreeMap<String, Destination>,
    collapsible: BTreeSet<String>,
}

impl DestinationRegistry {
    pub fn builder(prefix: impl Into<String>) -> DestinationRegistryBuilder {
        DestinationRegistryBuilder::new(prefix)
    }

    /// Resolve a topic to its destination.
    pub fn resolve(&self, topic: &str) -> Result<&Destination> {
        self.destinations
            .get(topic)
            .ok_or_else(|| Error::UnknownTopic(topic.to_string()))
    }

    /// Every registered destination, one per topic, ordered by queue then topic.
    ///
    /// Topics may share a queue; [`queues`](Self::queues) folds this list into
    /// one entry per physical queue for provisioning.
    pub fn all_destinations(&self) -> Vec<Destination> {
        let mut all: Vec<Destination> = self.destinations.values().cloned().collect();
        all.sort_by(|a, b| {
            a.queue_name
                .cmp(&b.queue_name)
                .then_with(|| a.topic_name.cmp(&b.topic_name))
        });
        all
    }

    /// Distinct physical queues from [`all_destinations`](Self::all_destinations),
    /// each with the merged options of every topic routed to it, ordered by name.
    pub fn queues(&self) -> Vec<(String, QueueOptions)> {
        let mut queues: Vec<(String, QueueOptions)> = Vec::new();
        for dest in self.all_destinations() {
            match queues.last_mut() {
                Some((queue, options)) if *queue == dest.queue_name => {
                    *options = options.merge(dest.queue_options);
                }
                _ => queues.push((dest.queue_name, dest.queue_options)),
            }
        }
        queues
    }

    /// Topics routed to the given physical queue.
    pub fn topics_for_queue(&self, queue: &str) -> Vec<&str> {
        self.destinations
            .values()
            .filter(|d| d.queue_name == queue)
            .map(|d| d.topic_name.as_str())
            .collect()
    }

    pub fn is_collapsible(&self, topic: &str) -> bool {
        self.collapsible.contains(topic)
    }

    pub fn collapsible_topics(&self) -> impl Iterator<Item = &str> {
        self.collapsible.iter().map(String::as_str)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_rule_is_plain_concatenation() {
        assert_eq!(queue_name_for("q.", "orders.created"), "q.orders.created");
        assert_eq!(queue_name_for("", "orders"), "orders");
    }

    #[test]
    fn merge_keeps_strictest_settings() {
        let a = QueueOptions::default();
        let b = QueueOptions {
            durable: false,
            exclusive: false,
            priority: true,
        };
        let merged = a.merge(b);
        assert!(!merged.durable);
        assert!(merged.priority);
    }

    #[test]
    fn conflicting_overrides_fail_build() {
        let result = DestinationRegistry::builder("q.")
            .topic(TopicEntry::new("a").queue("one"))
            .topic(TopicEntry::new("a").queue("two"))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
