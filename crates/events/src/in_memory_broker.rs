//! In-memory broker for tests/dev.
//!
//! - Topics are append-only logs with a single partition (`0`)
//! - Consumer groups track a committed offset per topic
//! - A consumer starts from its group's committed offsets, so a "restarted"
//!   consumer re-delivers everything that was polled but never committed
//! - Send and commit callbacks run synchronously on the caller's thread

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::broker::{BrokerError, CommitCallback, Consumer, DeliveryCallback, PollError, Producer};
use crate::message::{DeliveryReport, Headers, Message, Offset, OutgoingMessage, SourcePosition};

const PARTITION: i32 = 0;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    value: Vec<u8>,
    headers: Headers,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<StoredRecord>>,
    /// (group, topic) -> next offset to read after a restart.
    committed: HashMap<(String, String), u64>,
    /// Every successful commit, in order, per group.
    commit_log: HashMap<String, Vec<SourcePosition>>,
    failing_topics: HashSet<String>,
    failing_commits: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    arrivals: Condvar,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Broker state is only mutated by short, non-panicking sections.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process pub/sub broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer(&self) -> InMemoryProducer {
        InMemoryProducer {
            shared: self.shared.clone(),
        }
    }

    /// Create a consumer in `group` returning at most `max_poll_records` per poll.
    pub fn consumer(&self, group: impl Into<String>, max_poll_records: usize) -> InMemoryConsumer {
        InMemoryConsumer {
            shared: self.shared.clone(),
            group: group.into(),
            max_poll_records: max_poll_records.max(1),
            fetch: Mutex::new(Vec::new()),
            woken: AtomicBool::new(false),
        }
    }

    /// Append a message directly, bypassing send-failure injection.
    pub fn append(&self, message: OutgoingMessage) -> DeliveryReport {
        let mut state = lock(&self.shared.state);
        let report = append_record(&mut state, message);
        self.shared.arrivals.notify_all();
        report
    }

    /// Snapshot of every message currently in `topic`.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        let state = lock(&self.shared.state);
        state
            .topics
            .get(topic)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(i, r)| to_message(topic, i as u64, r))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Next offset `group` would read from `topic` after a restart.
    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<u64> {
        let state = lock(&self.shared.state);
        state
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    /// Every position `group` has successfully committed, in commit order.
    pub fn committed_positions(&self, group: &str) -> Vec<SourcePosition> {
        let state = lock(&self.shared.state);
        state.commit_log.get(group).cloned().unwrap_or_default()
    }

    /// Make every send to `topic` fail until [`restore_sends_to`](Self::restore_sends_to).
    pub fn fail_sends_to(&self, topic: impl Into<String>) {
        lock(&self.shared.state).failing_topics.insert(topic.into());
    }

    pub fn restore_sends_to(&self, topic: &str) {
        lock(&self.shared.state).failing_topics.remove(topic);
    }

    /// Make every commit fail (or succeed again).
    pub fn fail_commits(&self, fail: bool) {
        lock(&self.shared.state).failing_commits = fail;
    }
}

fn append_record(state: &mut BrokerState, message: OutgoingMessage) -> DeliveryReport {
    let log = state.topics.entry(message.topic.clone()).or_default();
    log.push(StoredRecord {
        key: message.key,
        value: message.value,
        headers: message.headers,
    });

    DeliveryReport {
        topic: message.topic,
        partition: PARTITION,
        offset: Offset::Index((log.len() - 1) as u64),
    }
}

fn to_message(topic: &str, offset: u64, record: &StoredRecord) -> Message {
    Message::new(
        SourcePosition::new(topic, PARTITION, Offset::Index(offset)),
        record.key.clone(),
        record.value.clone(),
        record.headers.clone(),
    )
}

/// Producer handle onto an [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryProducer {
    shared: Arc<Shared>,
}

impl Producer for InMemoryProducer {
    fn send(&self, message: OutgoingMessage, on_delivery: DeliveryCallback) {
        let result = {
            let mut state = lock(&self.shared.state);
            if state.failing_topics.contains(&message.topic) {
                Err(BrokerError::Rejected {
                    topic: message.topic.clone(),
                    reason: "send failure injected".to_string(),
                })
            } else {
                let report = append_record(&mut state, message);
                self.shared.arrivals.notify_all();
                Ok(report)
            }
        };

        // Lock released before running caller code.
        on_delivery(result);
    }
}

/// Consumer handle onto an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    shared: Arc<Shared>,
    group: String,
    max_poll_records: usize,
    /// Subscribed topics with their next fetch offset, in subscription order.
    fetch: Mutex<Vec<(String, u64)>>,
    woken: AtomicBool,
}

impl InMemoryConsumer {
    pub fn group(&self) -> &str {
        &self.group
    }

    fn take_batch(&self, state: &BrokerState, fetch: &mut [(String, u64)]) -> Vec<Message> {
        let mut batch = Vec::new();

        for (topic, next) in fetch.iter_mut() {
            let Some(log) = state.topics.get(topic) else {
                continue;
            };

            while batch.len() < self.max_poll_records && (*next as usize) < log.len() {
                batch.push(to_message(topic, *next, &log[*next as usize]));
                *next += 1;
            }

            if batch.len() >= self.max_poll_records {
                break;
            }
        }

        batch
    }
}

impl Consumer for InMemoryConsumer {
    fn subscribe(&self, topics: &[&str]) -> Result<(), BrokerError> {
        let mut state = lock(&self.shared.state);
        let mut fetch = lock(&self.fetch);

        fetch.clear();
        for topic in topics {
            state.topics.entry((*topic).to_string()).or_default();
            let start = state
                .committed
                .get(&(self.group.clone(), (*topic).to_string()))
                .copied()
                .unwrap_or(0);
            fetch.push(((*topic).to_string(), start));
        }

        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<Message>, PollError> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);

        loop {
            // Checked under the state lock; `wakeup` notifies under the same lock.
            if self.woken.swap(false, Ordering::SeqCst) {
                return Err(PollError::Woken);
            }

            {
                let mut fetch = lock(&self.fetch);
                if fetch.is_empty() {
                    return Err(PollError::Broker(BrokerError::NotSubscribed));
                }

                let batch = self.take_batch(&state, &mut fetch);
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            state = self
                .shared
                .arrivals
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn commit_async(&self, position: &SourcePosition, on_complete: CommitCallback) {
        let result = {
            let mut state = lock(&self.shared.state);
            match position.offset() {
                _ if state.failing_commits => {
                    Err(BrokerError::CommitRejected("commit failure injected".to_string()))
                }
                Offset::Index(offset) => {
                    let key = (self.group.clone(), position.topic().to_string());
                    let next = offset + 1;
                    let committed = state.committed.entry(key).or_insert(0);
                    if next > *committed {
                        *committed = next;
                    }
                    state
                        .commit_log
                        .entry(self.group.clone())
                        .or_default()
                        .push(position.clone());
                    Ok(())
                }
                Offset::StreamId(id) => Err(BrokerError::CommitRejected(format!(
                    "stream offset {id} is not valid for the in-memory broker"
                ))),
            }
        };

        on_complete(result);
    }

    fn wakeup(&self) {
        self.woken.store(true, Ordering::SeqCst);
        let _state = lock(&self.shared.state);
        self.shared.arrivals.notify_all();
    }
}
