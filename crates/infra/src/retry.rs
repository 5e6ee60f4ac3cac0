//! Retry routing with exponential backoff.
//!
//! A failed message is republished to the retry topic with an incremented
//! `retries` header until the policy's attempt budget is spent; after that it
//! goes to the dead-letter topic unchanged.
//!
//! The retry copy keeps the key, the value and every header of the failed
//! message; only `retries` is replaced, so tracing headers survive the detour.
//!
//! The backoff is a blocking sleep on the consume-loop thread. It throttles
//! the whole loop, and an in-flight sleep is not interrupted by shutdown.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use orderflow_events::{
    AttemptCount, BrokerError, DeliveryReport, Message, OutgoingMessage, Producer,
};

use crate::dead_letter::{DeadLetterEvent, DeadLetterJournal, DeadLetterRouter};

/// Blocks the calling thread for a backoff delay. Swappable for tests.
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Retry budget and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry publishes (0 = dead-letter on first failure).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each following attempt.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
        }
    }

    /// Delay before publishing `attempt` (1-indexed): `initial * 2^(attempt-1)`.
    ///
    /// Attempt 0 is treated as attempt 1. Saturates at [`Duration::MAX`].
    pub fn backoff_for(&self, attempt: AttemptCount) -> Duration {
        let exponent = attempt.get().saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.initial_backoff.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// What to do with a message that already went through `current` retries.
    pub fn decide(&self, current: AttemptCount) -> RetryOutcome {
        let attempt = current.next();
        if attempt.get() <= self.max_attempts {
            RetryOutcome::Retried {
                attempt,
                backoff: self.backoff_for(attempt),
            }
        } else {
            RetryOutcome::DeadLettered { attempts: current }
        }
    }
}

/// Where a failed message was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Republished to the retry topic carrying `attempt` in its header.
    Retried {
        attempt: AttemptCount,
        backoff: Duration,
    },
    /// Forwarded to the dead-letter topic after `attempts` retries.
    DeadLettered { attempts: AttemptCount },
}

/// Routes failed messages to the retry topic or the dead-letter topic.
pub struct RetryRouter<P, D> {
    policy: RetryPolicy,
    retry_topic: String,
    producer: P,
    dead_letter: DeadLetterRouter<D>,
    journal: Option<Arc<DeadLetterJournal>>,
    sleeper: Sleeper,
}

impl<P: Producer, D: Producer> RetryRouter<P, D> {
    pub fn new(
        policy: RetryPolicy,
        retry_topic: impl Into<String>,
        producer: P,
        dead_letter: DeadLetterRouter<D>,
    ) -> Self {
        Self {
            policy,
            retry_topic: retry_topic.into(),
            producer,
            dead_letter,
            journal: None,
            sleeper: Arc::new(thread::sleep),
        }
    }

    /// Record every dead-lettered message in `journal`.
    pub fn with_journal(mut self, journal: Arc<DeadLetterJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn retry_topic(&self) -> &str {
        &self.retry_topic
    }

    /// Route `message`, which failed with `error`.
    ///
    /// Never fails: publish outcomes are only logged by the delivery callbacks.
    pub fn handle_failure(
        &self,
        message: &Message,
        error: &(dyn std::error::Error + 'static),
    ) -> RetryOutcome {
        let current = AttemptCount::from_headers(message.headers());
        let outcome = self.policy.decide(current);
        let key = message.key().unwrap_or("<none>");

        match outcome {
            RetryOutcome::Retried { attempt, backoff } => {
                warn!(
                    key,
                    attempt = attempt.get(),
                    max = self.policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "processing failed; scheduling retry"
                );

                (self.sleeper)(backoff);
                self.republish(message, attempt);
            }
            RetryOutcome::DeadLettered { attempts } => {
                error!(
                    key,
                    attempts = attempts.get(),
                    error = %error,
                    "retries exhausted; sending to dead-letter topic"
                );

                self.dead_letter.send(message);
                if let Some(journal) = &self.journal {
                    journal.record(DeadLetterEvent {
                        key: message.key().map(str::to_string),
                        source_topic: message.topic().to_string(),
                        reason: error.to_string(),
                        attempts: attempts.get(),
                        dead_lettered_at: Utc::now(),
                    });
                }
            }
        }

        outcome
    }

    fn republish(&self, message: &Message, attempt: AttemptCount) {
        let mut outgoing = OutgoingMessage::copy_of(message, self.retry_topic.clone());
        attempt.write_to(&mut outgoing.headers);
        let key = message.key().map(str::to_string);

        self.producer.send(
            outgoing,
            Box::new(move |result: Result<DeliveryReport, BrokerError>| match result {
                Ok(report) => info!(
                    key = key.as_deref().unwrap_or("<none>"),
                    attempt = attempt.get(),
                    topic = %report.topic,
                    partition = report.partition,
                    offset = %report.offset,
                    "sent message to retry topic"
                ),
                Err(e) => error!(
                    key = key.as_deref().unwrap_or("<none>"),
                    attempt = attempt.get(),
                    error = %e,
                    "failed to send message to retry topic"
                ),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use orderflow_events::{
        CodecError, Headers, InMemoryBroker, InMemoryProducer, Offset, RETRIES_HEADER,
        SourcePosition,
    };
    use proptest::prelude::*;

    use super::*;

    struct Harness {
        broker: InMemoryBroker,
        router: RetryRouter<InMemoryProducer, InMemoryProducer>,
        journal: Arc<DeadLetterJournal>,
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    fn harness(max_attempts: u32) -> Harness {
        let broker = InMemoryBroker::new();
        let journal = Arc::new(DeadLetterJournal::new());
        let sleeps = Arc::new(Mutex::new(Vec::new()));

        let recorded = sleeps.clone();
        let router = RetryRouter::new(
            RetryPolicy::new(max_attempts, Duration::from_millis(500)),
            "orders-retry",
            broker.producer(),
            DeadLetterRouter::new(broker.producer(), "orders-dlq"),
        )
        .with_journal(journal.clone())
        .with_sleeper(Arc::new(move |d: Duration| recorded.lock().unwrap().push(d)));

        Harness {
            broker,
            router,
            journal,
            sleeps,
        }
    }

    fn message_with(headers: Headers) -> Message {
        Message::new(
            SourcePosition::new("orders", 0, Offset::Index(0)),
            Some("o1".to_string()),
            br#"{"orderId":"o1","product":"mouse","price":25.0}"#.to_vec(),
            headers,
        )
    }

    fn retries(value: &str) -> Headers {
        let mut h = Headers::new();
        h.add(RETRIES_HEADER, value);
        h
    }

    fn failure() -> CodecError {
        CodecError::Decode("boom".to_string())
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(AttemptCount::new(1)), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(AttemptCount::new(2)), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(AttemptCount::new(3)), Duration::from_millis(2000));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1));
        assert_eq!(policy.backoff_for(AttemptCount::new(200)), Duration::MAX);
    }

    #[test]
    fn decide_dead_letters_once_budget_is_spent() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.decide(AttemptCount::new(2)),
            RetryOutcome::Retried { attempt, .. } if attempt.get() == 3
        ));
        assert_eq!(
            policy.decide(AttemptCount::new(3)),
            RetryOutcome::DeadLettered {
                attempts: AttemptCount::new(3)
            }
        );
    }

    #[test]
    fn zero_attempts_dead_letters_immediately() {
        let h = harness(0);
        let outcome = h.router.handle_failure(&message_with(Headers::new()), &failure());

        assert_eq!(
            outcome,
            RetryOutcome::DeadLettered {
                attempts: AttemptCount::ZERO
            }
        );
        assert!(h.broker.messages("orders-retry").is_empty());
        assert_eq!(h.broker.messages("orders-dlq").len(), 1);
    }

    #[test]
    fn first_failure_is_republished_with_retries_one() {
        let h = harness(3);
        let original = message_with(Headers::new());

        let outcome = h.router.handle_failure(&original, &failure());

        assert!(matches!(outcome, RetryOutcome::Retried { attempt, .. } if attempt.get() == 1));
        assert_eq!(*h.sleeps.lock().unwrap(), vec![Duration::from_millis(500)]);

        let retried = h.broker.messages("orders-retry");
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].key(), Some("o1"));
        assert_eq!(retried[0].value(), original.value());
        assert_eq!(retried[0].headers().last(RETRIES_HEADER), Some(&b"1"[..]));
        assert!(h.broker.messages("orders-dlq").is_empty());
    }

    #[test]
    fn retry_replaces_counter_and_keeps_other_headers() {
        let h = harness(3);
        let mut headers = retries("1");
        headers.add("trace", "t-1");

        h.router.handle_failure(&message_with(headers), &failure());

        let retried = &h.broker.messages("orders-retry")[0];
        assert_eq!(retried.headers().last(RETRIES_HEADER), Some(&b"2"[..]));
        assert_eq!(retried.headers().last("trace"), Some(&b"t-1"[..]));
        let counters = retried
            .headers()
            .iter()
            .filter(|h| h.name == RETRIES_HEADER)
            .count();
        assert_eq!(counters, 1);
        assert_eq!(*h.sleeps.lock().unwrap(), vec![Duration::from_millis(1000)]);
    }

    #[test]
    fn invalid_counter_is_treated_as_zero() {
        let h = harness(3);

        h.router.handle_failure(&message_with(retries("abc")), &failure());

        let retried = &h.broker.messages("orders-retry")[0];
        assert_eq!(retried.headers().last(RETRIES_HEADER), Some(&b"1"[..]));
    }

    #[test]
    fn exhausted_message_goes_to_dead_letter_unmodified() {
        let h = harness(3);
        let original = message_with(retries("3"));

        let outcome = h.router.handle_failure(&original, &failure());

        assert_eq!(
            outcome,
            RetryOutcome::DeadLettered {
                attempts: AttemptCount::new(3)
            }
        );
        assert!(h.broker.messages("orders-retry").is_empty());
        assert!(h.sleeps.lock().unwrap().is_empty());

        let dlq = h.broker.messages("orders-dlq");
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].headers(), original.headers());
        assert_eq!(dlq[0].value(), original.value());

        let journal = h.journal.recent();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].key.as_deref(), Some("o1"));
        assert_eq!(journal[0].source_topic, "orders");
        assert_eq!(journal[0].attempts, 3);
        assert!(journal[0].reason.contains("boom"));
    }

    #[test]
    fn retry_publish_failure_is_only_logged() {
        let h = harness(3);
        h.broker.fail_sends_to("orders-retry");

        let outcome = h.router.handle_failure(&message_with(Headers::new()), &failure());

        assert!(matches!(outcome, RetryOutcome::Retried { .. }));
        assert!(h.broker.messages("orders-retry").is_empty());
        assert!(h.broker.messages("orders-dlq").is_empty());
    }

    proptest! {
        /// Property: backoff(a) = initial * 2^(a-1) for every attempt in budget.
        #[test]
        fn backoff_matches_formula(initial_ms in 1u64..10_000, attempt in 1u32..=16) {
            let policy = RetryPolicy::new(16, Duration::from_millis(initial_ms));
            let expected = Duration::from_millis(initial_ms * (1u64 << (attempt - 1)));
            prop_assert_eq!(policy.backoff_for(AttemptCount::new(attempt)), expected);
        }

        /// Property: the schedule never shrinks as attempts grow.
        #[test]
        fn backoff_is_monotonic(initial_ms in 0u64..100_000, attempt in 1u32..64) {
            let policy = RetryPolicy::new(64, Duration::from_millis(initial_ms));
            let this = policy.backoff_for(AttemptCount::new(attempt));
            let next = policy.backoff_for(AttemptCount::new(attempt + 1));
            prop_assert!(next >= this);
        }
    }
}
