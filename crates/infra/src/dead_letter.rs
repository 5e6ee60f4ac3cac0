//! Dead-letter routing.
//!
//! Messages that exhausted their retries are copied verbatim (key, value and
//! headers) to a fixed dead-letter topic. The publish is fire-and-forget: if
//! it fails the failure is logged and the message is gone from the pipeline.
//! There is no fallback store.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use orderflow_events::{BrokerError, DeliveryReport, Message, OutgoingMessage, Producer};

/// Number of dead-letter events kept by default.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 20;

/// Publishes failed messages to the dead-letter topic.
#[derive(Debug)]
pub struct DeadLetterRouter<P> {
    producer: P,
    topic: String,
}

impl<P: Producer> DeadLetterRouter<P> {
    pub fn new(producer: P, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish an unmodified copy of `message` to the dead-letter topic.
    pub fn send(&self, message: &Message) {
        let outgoing = OutgoingMessage::copy_of(message, self.topic.clone());
        let key = message.key().map(str::to_string);

        self.producer.send(
            outgoing,
            Box::new(move |result: Result<DeliveryReport, BrokerError>| match result {
                Ok(report) => info!(
                    key = key.as_deref().unwrap_or("<none>"),
                    topic = %report.topic,
                    partition = report.partition,
                    offset = %report.offset,
                    "sent message to dead-letter topic"
                ),
                Err(e) => error!(
                    key = key.as_deref().unwrap_or("<none>"),
                    error = %e,
                    "failed to send message to dead-letter topic; message dropped"
                ),
            }),
        );
    }
}

/// A dead-lettered message, as recorded for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEvent {
    pub key: Option<String>,
    pub source_topic: String,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Bounded, newest-first record of recent dead-letter events.
///
/// This is an in-process view for operators (served on `/dlq`); the
/// dead-letter topic stays the source of truth.
#[derive(Debug)]
pub struct DeadLetterJournal {
    entries: Mutex<VecDeque<DeadLetterEvent>>,
    capacity: usize,
}

impl Default for DeadLetterJournal {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_JOURNAL_CAPACITY)
    }
}

impl DeadLetterJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeadLetterEvent>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, event: DeadLetterEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.lock();
        entries.push_front(event);
        entries.truncate(self.capacity);
    }

    /// Recorded events, newest first.
    pub fn recent(&self) -> Vec<DeadLetterEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
