//! Broker-facing message model.
//!
//! A [`Message`] is what a consumer hands to the pipeline: key, raw value,
//! ordered headers and the position it was read from. An [`OutgoingMessage`]
//! is what the pipeline hands back to a producer.

use std::fmt;

/// Offset of a message within a topic partition.
///
/// Log-style brokers use a numeric index; stream-style brokers (e.g. Redis
/// Streams) use an opaque entry id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Offset {
    Index(u64),
    StreamId(String),
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Index(i) => write!(f, "{i}"),
            Offset::StreamId(id) => f.write_str(id),
        }
    }
}

/// Where a consumed message came from. Used to commit progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePosition {
    topic: String,
    partition: i32,
    offset: Offset,
}

impl SourcePosition {
    pub fn new(topic: impl Into<String>, partition: i32, offset: Offset) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> &Offset {
        &self.offset
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A single header entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

/// Ordered header list. Names may repeat; lookups return the last entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, keeping any existing entries with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replace every entry named `name` with a single entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        self.entries.retain(|h| h.name != name);
        self.entries.push(Header {
            name,
            value: value.into(),
        });
    }

    /// Value of the last entry named `name`.
    pub fn last(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .rev()
            .find(|h| h.name == name)
            .map(|h| h.value.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Vec<u8>)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, value)| Header { name, value })
                .collect(),
        }
    }
}

/// A message read from a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    key: Option<String>,
    value: Vec<u8>,
    headers: Headers,
    position: SourcePosition,
}

impl Message {
    pub fn new(
        position: SourcePosition,
        key: Option<String>,
        value: Vec<u8>,
        headers: Headers,
    ) -> Self {
        Self {
            key,
            value,
            headers,
            position,
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn position(&self) -> &SourcePosition {
        &self.position
    }

    pub fn topic(&self) -> &str {
        self.position.topic()
    }
}

/// A message on its way to a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: Headers,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, key: Option<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key,
            value,
            headers: Headers::new(),
        }
    }

    /// Copy key, value and headers of a consumed message, addressed to `topic`.
    pub fn copy_of(message: &Message, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: message.key.clone(),
            value: message.value.clone(),
            headers: message.headers.clone(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// Broker acknowledgement of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    pub offset: Offset,
}
