//! The consume loop.
//!
//! One dedicated thread subscribes to the primary and retry topics, polls
//! batches and handles every message in arrival order:
//!
//! - success: log, then commit the message's position asynchronously
//! - failure (decode or processing): hand the message to the [`RetryRouter`],
//!   do not commit
//!
//! Delivery is at-least-once: a crash between processing and commit replays
//! the message and the aggregate counts it twice.
//!
//! ## Shutdown
//!
//! [`ShutdownHandle::shutdown`] flips the loop to `Draining` and wakes the
//! consumer out of a blocked poll. The current batch is finished, then the
//! loop returns `Ok(())`. A wakeup seen while still `Running` did not come
//! from the handle and is returned as [`ConsumeError::UnexpectedWakeup`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use orderflow_core::Order;
use orderflow_events::{BrokerError, Codec, Consumer, JsonOrderCodec, Message, PollError, Producer};

use crate::processor::OrderProcessor;
use crate::retry::{RetryOutcome, RetryRouter};

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("failed to subscribe: {0}")]
    Subscribe(#[from] BrokerError),

    #[error("consumer woken up while running")]
    UnexpectedWakeup,

    #[error("consume loop already stopped")]
    AlreadyStopped,

    #[error("consume loop thread panicked")]
    WorkerPanicked,
}

/// Topics and poll timing for a [`ConsumeLoop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub primary_topic: String,
    pub retry_topic: String,
    pub poll_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            primary_topic: "orders".to_string(),
            retry_topic: "orders-retry".to_string(),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// Lifecycle of a consume loop. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LoopState {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

impl LoopState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LoopState::Running,
            1 => LoopState::Draining,
            _ => LoopState::Stopped,
        }
    }
}

#[derive(Debug)]
struct LoopControl {
    state: AtomicU8,
}

impl LoopControl {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(LoopState::Running as u8),
        }
    }

    fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// `Running -> Draining`. False if the loop was not running.
    fn begin_drain(&self) -> bool {
        self.state
            .compare_exchange(
                LoopState::Running as u8,
                LoopState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn stop(&self) {
        self.state.store(LoopState::Stopped as u8, Ordering::SeqCst);
    }
}

/// Counters maintained by the loop.
#[derive(Debug, Default)]
pub struct LoopStats {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    committed: AtomicU64,
    commit_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub committed: u64,
    pub commit_failures: u64,
}

impl LoopStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
        }
    }
}

/// Requests shutdown of a consume loop from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    control: Arc<LoopControl>,
    consumer: Arc<dyn Consumer>,
}

impl ShutdownHandle {
    /// Ask the loop to stop after the current batch. Idempotent.
    pub fn shutdown(&self) {
        if self.control.begin_drain() {
            info!("consumer shutdown requested");
            self.consumer.wakeup();
        }
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn state(&self) -> LoopState {
        self.control.state()
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Polls the primary and retry topics and routes every message.
pub struct ConsumeLoop<C, P, D, K = JsonOrderCodec> {
    consumer: Arc<C>,
    processor: OrderProcessor<K>,
    router: RetryRouter<P, D>,
    config: LoopConfig,
    control: Arc<LoopControl>,
    stats: Arc<LoopStats>,
}

impl<C, P, D, K> ConsumeLoop<C, P, D, K>
where
    C: Consumer + 'static,
    P: Producer,
    D: Producer,
    K: Codec<Order>,
{
    pub fn new(
        consumer: C,
        processor: OrderProcessor<K>,
        router: RetryRouter<P, D>,
        config: LoopConfig,
    ) -> Self {
        Self {
            consumer: Arc::new(consumer),
            processor,
            router,
            config,
            control: Arc::new(LoopControl::new()),
            stats: Arc::new(LoopStats::default()),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        let consumer: Arc<dyn Consumer> = self.consumer.clone();
        ShutdownHandle {
            control: self.control.clone(),
            consumer,
        }
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        self.stats.clone()
    }

    pub fn state(&self) -> LoopState {
        self.control.state()
    }

    /// Run the loop on the calling thread until shutdown or a fatal error.
    ///
    /// The loop ends `Stopped` whatever the outcome and cannot be run again.
    pub fn run(&self) -> Result<(), ConsumeError> {
        if self.control.state() == LoopState::Stopped {
            return Err(ConsumeError::AlreadyStopped);
        }

        let result = self.subscribe_and_poll();
        self.control.stop();

        let stats = self.stats.snapshot();
        match &result {
            Ok(()) => info!(
                processed = stats.processed,
                failed = stats.failed,
                committed = stats.committed,
                "consumer stopped"
            ),
            Err(e) => error!(error = %e, "consumer stopped with error"),
        }

        result
    }

    fn subscribe_and_poll(&self) -> Result<(), ConsumeError> {
        let topics = [
            self.config.primary_topic.as_str(),
            self.config.retry_topic.as_str(),
        ];
        self.consumer.subscribe(&topics)?;
        info!(topics = ?topics, "consumer started");

        while self.control.is_running() {
            match self.consumer.poll(self.config.poll_timeout) {
                Ok(batch) => {
                    for message in &batch {
                        self.dispatch(message);
                    }
                }
                Err(PollError::Woken) => {
                    if self.control.is_running() {
                        error!("unexpected consumer wakeup while running");
                        return Err(ConsumeError::UnexpectedWakeup);
                    }
                }
                Err(PollError::Broker(e)) => {
                    warn!(error = %e, "poll failed; backing off");
                    thread::sleep(self.config.poll_timeout);
                }
            }
        }

        Ok(())
    }

    fn dispatch(&self, message: &Message) {
        match self.processor.process(message) {
            Ok(processed) => {
                LoopStats::incr(&self.stats.processed);
                info!(
                    key = message.key().unwrap_or("<none>"),
                    category = processed.order.category(),
                    amount = processed.order.amount(),
                    average = processed.average,
                    "consumed order"
                );
                self.commit(message);
            }
            Err(e) => {
                LoopStats::incr(&self.stats.failed);
                match self.router.handle_failure(message, &e) {
                    RetryOutcome::Retried { .. } => LoopStats::incr(&self.stats.retried),
                    RetryOutcome::DeadLettered { .. } => {
                        LoopStats::incr(&self.stats.dead_lettered)
                    }
                }
            }
        }
    }

    fn commit(&self, message: &Message) {
        let stats = self.stats.clone();
        let position = message.position().clone();

        self.consumer.commit_async(
            message.position(),
            Box::new(move |result: Result<(), BrokerError>| match result {
                Ok(()) => LoopStats::incr(&stats.committed),
                Err(e) => {
                    LoopStats::incr(&stats.commit_failures);
                    error!(position = %position, error = %e, "commit failed");
                }
            }),
        );
    }
}

impl<C, P, D, K> ConsumeLoop<C, P, D, K>
where
    C: Consumer + 'static,
    P: Producer + 'static,
    D: Producer + 'static,
    K: Codec<Order> + 'static,
{
    /// Run the loop on a named background thread.
    pub fn spawn(self, name: &str) -> ConsumerWorker {
        let handle = self.shutdown_handle();
        let stats = self.stats();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())
            .expect("failed to spawn consume loop thread");

        ConsumerWorker {
            handle,
            stats,
            join,
        }
    }
}

/// A consume loop running on its own thread.
#[derive(Debug)]
pub struct ConsumerWorker {
    handle: ShutdownHandle,
    stats: Arc<LoopStats>,
    join: thread::JoinHandle<Result<(), ConsumeError>>,
}

impl ConsumerWorker {
    pub fn handle(&self) -> &ShutdownHandle {
        &self.handle
    }

    pub fn stats(&self) -> &Arc<LoopStats> {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request shutdown and wait for the loop to stop.
    pub fn shutdown(self) -> Result<(), ConsumeError> {
        self.handle.shutdown();
        self.join()
    }

    /// Wait for the loop to stop on its own.
    pub fn join(self) -> Result<(), ConsumeError> {
        self.join
            .join()
            .map_err(|_| ConsumeError::WorkerPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;

    use orderflow_events::{
        CommitCallback, InMemoryBroker, InMemoryProducer, OutgoingMessage, SourcePosition,
    };

    use super::*;
    use crate::aggregator::Aggregator;
    use crate::dead_letter::DeadLetterRouter;
    use crate::retry::RetryPolicy;

    type TestLoop<C> = ConsumeLoop<C, InMemoryProducer, InMemoryProducer>;

    fn build<C: Consumer + 'static>(broker: &InMemoryBroker, consumer: C) -> TestLoop<C> {
        let router = RetryRouter::new(
            RetryPolicy::new(3, Duration::ZERO),
            "orders-retry",
            broker.producer(),
            DeadLetterRouter::new(broker.producer(), "orders-dlq"),
        );
        ConsumeLoop::new(
            consumer,
            OrderProcessor::json(Arc::new(Aggregator::new())),
            router,
            LoopConfig {
                poll_timeout: Duration::from_millis(20),
                ..LoopConfig::default()
            },
        )
    }

    /// Consumer whose poll always fails with a transport error.
    struct FlakyConsumer {
        polls: AtomicU64,
        woken: Mutex<bool>,
    }

    impl Consumer for FlakyConsumer {
        fn subscribe(&self, _topics: &[&str]) -> Result<(), BrokerError> {
            Ok(())
        }

        fn poll(&self, _timeout: Duration) -> Result<Vec<Message>, PollError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut woken = self.woken.lock().unwrap();
            if *woken {
                *woken = false;
                return Err(PollError::Woken);
            }
            Err(PollError::Broker(BrokerError::Connection("refused".to_string())))
        }

        fn commit_async(&self, _position: &SourcePosition, on_complete: CommitCallback) {
            on_complete(Ok(()));
        }

        fn wakeup(&self) {
            *self.woken.lock().unwrap() = true;
        }
    }

    #[test]
    fn new_loop_is_running() {
        let broker = InMemoryBroker::new();
        let lp = build(&broker, broker.consumer("g", 10));
        assert_eq!(lp.state(), LoopState::Running);
        assert!(lp.shutdown_handle().is_running());
    }

    #[test]
    fn shutdown_before_run_exits_cleanly() {
        let broker = InMemoryBroker::new();
        let lp = build(&broker, broker.consumer("g", 10));

        let handle = lp.shutdown_handle();
        handle.shutdown();
        assert_eq!(handle.state(), LoopState::Draining);

        assert!(lp.run().is_ok());
        assert_eq!(lp.state(), LoopState::Stopped);
    }

    #[test]
    fn run_after_stop_is_rejected() {
        let broker = InMemoryBroker::new();
        let lp = build(&broker, broker.consumer("g", 10));
        lp.shutdown_handle().shutdown();
        lp.run().unwrap();

        assert!(matches!(lp.run(), Err(ConsumeError::AlreadyStopped)));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let broker = InMemoryBroker::new();
        let worker = build(&broker, broker.consumer("g", 10)).spawn("consume-test");

        let handle = worker.handle().clone();
        handle.shutdown();
        handle.shutdown();

        assert!(worker.shutdown().is_ok());
        assert_eq!(handle.state(), LoopState::Stopped);
    }

    #[test]
    fn transport_errors_do_not_stop_the_loop() {
        let broker = InMemoryBroker::new();
        let consumer = Arc::new(FlakyConsumer {
            polls: AtomicU64::new(0),
            woken: Mutex::new(false),
        });
        let worker = build(&broker, consumer.clone()).spawn("consume-flaky");

        let deadline = Instant::now() + Duration::from_secs(5);
        while consumer.polls.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(consumer.polls.load(Ordering::SeqCst) >= 3);
        assert!(!worker.is_finished());

        assert!(worker.shutdown().is_ok());
    }

    #[test]
    fn stats_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(LoopStatsSnapshot::default()).unwrap();
        assert_eq!(json["deadLettered"], 0);
        assert_eq!(json["commitFailures"], 0);
    }

    #[test]
    fn failed_order_counts_and_is_not_committed() {
        let broker = InMemoryBroker::new();
        broker.append(OutgoingMessage::new(
            "orders",
            Some("bad".to_string()),
            b"garbage".to_vec(),
        ));

        let worker = build(&broker, broker.consumer("g", 10)).spawn("consume-failed");
        let stats = worker.stats().clone();

        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.snapshot().failed == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        worker.shutdown().unwrap();

        let snap = stats.snapshot();
        assert!(snap.failed >= 1);
        assert_eq!(snap.processed, 0);
        assert_eq!(snap.committed, 0);
        assert!(broker.committed_positions("g").is_empty());
    }
}
