//! Processor registry: routes a message's topic to the processors subscribed to it.
//!
//! Built once at startup from each processor's static subscriptions and
//! read-only afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::destination::DestinationRegistryBuilder;
use crate::processor::{Processor, Subscription};

#[derive(Default)]
pub struct ProcessorRegistryBuilder {
    processors: Vec<Arc<dyn Processor>>,
}

impl ProcessorRegistryBuilder {
    pub fn register(self, processor: impl Processor + 'static) -> Self {
        self.register_arc(Arc::new(processor))
    }

    pub fn register_arc(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn build(self) -> ProcessorRegistry {
        let mut routes: BTreeMap<String, Vec<Arc<dyn Processor>>> = BTreeMap::new();
        let mut subscriptions = Vec::new();

        for processor in &self.processors {
            let mut seen = Vec::new();
            for sub in processor.subscriptions() {
                // A processor listing a topic twice still runs once per delivery.
                if seen.contains(&sub.topic) {
                    continue;
                }
                seen.push(sub.topic.clone());
                routes
                    .entry(sub.topic.clone())
                    .or_default()
                    .push(Arc::clone(processor));
                subscriptions.push(sub);
            }
        }

        ProcessorRegistry {
            routes,
            subscriptions,
        }
    }
}

/// Registry of processors, indexed by topic.
pub struct ProcessorRegistry {
    routes: BTreeMap<String, Vec<Arc<dyn Processor>>>,
    subscriptions: Vec<Subscription>,
}

impl ProcessorRegistry {
    pub fn builder() -> ProcessorRegistryBuilder {
        ProcessorRegistryBuilder::default()
    }

    /// Create an empty registry with no processors.
    pub fn empty() -> Self {
        Self::builder().build()
    }

    /// Processors subscribed to `topic`, in registration order.
    pub fn processors_for(&self, topic: &str) -> &[Arc<dyn Processor>] {
        self.routes.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Subscribed topics, sorted.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Register every subscribed topic, with its overrides, as a destination.
    pub fn declare_destinations(&self, builder: &mut DestinationRegistryBuilder) {
        for sub in &self.subscriptions {
            builder.declare(sub.to_topic_entry());
        }
    }
}
