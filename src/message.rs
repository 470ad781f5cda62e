//! Message model.
//!
//! A message is an opaque body plus producer-set properties and transport
//! headers. Identity is per instance: two messages with the same topic and
//! body are still distinct messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for message IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport handle for a received message, used to acknowledge or reject it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptHandle {
    /// Physical queue the message was received from.
    pub queue: String,
    /// Driver-specific delivery id.
    pub id: i64,
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// Scalar property value. Properties are set by the producer and never
/// interpreted by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(i64::from(v))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Message priority. Only honored by queues declared with priority support.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::VeryLow => "very_low",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::VeryHigh => "very_high",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "very_low" => Ok(Priority::VeryLow),
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "very_high" => Ok(Priority::VeryHigh),
            other => Err(Error::Other(format!("invalid priority: {other}"))),
        }
    }
}

/// Transport/runtime metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    pub content_type: String,
    #[serde(default)]
    pub priority: Priority,
    /// Delivery delay requested by the producer, in milliseconds.
    #[serde(default)]
    pub delay_ms: Option<u64>,
    /// Messages still undelivered past this instant are discarded.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for Headers {
    fn default() -> Self {
        Self {
            content_type: "application/json".to_string(),
            priority: Priority::Normal,
            delay_ms: None,
            expires_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The atomic unit of transport.
///
/// `redelivered`, `delivery_count` and `receipt` are owned by the transport
/// and are never serialized with the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub body: serde_json::Value,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub headers: Headers,
    pub published_at: DateTime<Utc>,

    /// True if the broker has attempted delivery of this message before.
    #[serde(skip)]
    pub redelivered: bool,
    /// Number of deliveries including the current one.
    #[serde(skip)]
    pub delivery_count: u32,
    #[serde(skip)]
    pub receipt: Option<ReceiptHandle>,
}

impl Message {
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.headers.expires_at.is_some_and(|at| at <= now)
    }

    /// The receipt handle, present only on messages handed out by a session.
    pub fn receipt(&self) -> Result<&ReceiptHandle> {
        self.receipt
            .as_ref()
            .ok_or_else(|| Error::Other(format!("message {} has no receipt handle", self.id)))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for outbound messages. The topic is supplied at publish time.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub(crate) body: serde_json::Value,
    pub(crate) properties: Properties,
    pub(crate) content_type: Option<String>,
    pub(crate) priority: Priority,
    pub(crate) delay: Option<Duration>,
    pub(crate) expiration: Option<Duration>,
}

impl OutgoingMessage {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            body,
            properties: Properties::new(),
            content_type: None,
            priority: Priority::Normal,
            delay: None,
            expiration: None,
        }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Time-to-live measured from publish time.
    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    pub fn get_properties(&self) -> &Properties {
        &self.properties
    }

    /// Stamp a fresh identity and headers for `topic`.
    pub fn into_message(self, topic: &str) -> Message {
        let now = Utc::now();
        let defaults = Headers::default();
        let expires_at = self
            .expiration
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);

        Message {
            id: MessageId::new(),
            topic: topic.to_string(),
            body: self.body,
            properties: self.properties,
            headers: Headers {
                content_type: self.content_type.unwrap_or(defaults.content_type),
                priority: self.priority,
                delay_ms: self.delay.map(|d| d.as_millis() as u64),
                expires_at,
            },
            published_at: now,
            redelivered: false,
            delivery_count: 0,
            receipt: None,
        }
    }
}

impl From<serde_json::Value> for OutgoingMessage {
    fn from(body: serde_json::Value) -> Self {
        Self::new(body)
    }
}
