//! Synthetic order generator feeding the orders topic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{error, info, warn};

use orderflow_core::{DomainError, Order, OrderId};
use orderflow_events::{
    BrokerError, Codec, CodecError, DeliveryReport, JsonOrderCodec, OutgoingMessage, Producer,
};

/// Product catalog the generator draws categories from.
pub const CATEGORIES: [&str; 5] = ["keyboard", "mouse", "monitor", "laptop", "dock"];

const MIN_AMOUNT: f64 = 50.0;
const MAX_AMOUNT: f64 = 300.0;

/// Longest uninterrupted sleep between stop-flag checks.
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Publishes random orders keyed by order id.
#[derive(Debug)]
pub struct OrderGenerator<P, K = JsonOrderCodec> {
    producer: P,
    topic: String,
    codec: K,
    interval: Duration,
    rng: StdRng,
}

impl<P: Producer> OrderGenerator<P, JsonOrderCodec> {
    pub fn new(producer: P, topic: impl Into<String>, interval: Duration) -> Self {
        Self::with_codec(producer, topic, interval, JsonOrderCodec)
    }
}

impl<P: Producer, K: Codec<Order>> OrderGenerator<P, K> {
    pub fn with_codec(producer: P, topic: impl Into<String>, interval: Duration, codec: K) -> Self {
        Self {
            producer,
            topic: topic.into(),
            codec,
            interval,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a deterministic random source.
    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Build a random order: fresh id, catalog category, amount in `[50, 300)`.
    pub fn generate(&mut self) -> Result<Order, GenerateError> {
        let category = CATEGORIES.choose(&mut self.rng).copied().unwrap_or("dock");
        let amount = self.rng.gen_range(MIN_AMOUNT..MAX_AMOUNT);
        Ok(Order::new(OrderId::generate(), category, amount)?)
    }

    /// Generate one order and publish it. The delivery outcome is only logged.
    pub fn publish_one(&mut self) -> Result<Order, GenerateError> {
        let order = self.generate()?;
        let value = self.codec.encode(&order)?;
        let key = order.id().to_string();

        let outgoing = OutgoingMessage::new(self.topic.clone(), Some(key.clone()), value);
        let (category, amount) = (order.category().to_string(), order.amount());

        self.producer.send(
            outgoing,
            Box::new(move |result: Result<DeliveryReport, BrokerError>| match result {
                Ok(report) => info!(
                    key = %key,
                    category = %category,
                    amount,
                    topic = %report.topic,
                    offset = %report.offset,
                    "produced order"
                ),
                Err(e) => error!(key = %key, error = %e, "failed to produce order"),
            }),
        );

        Ok(order)
    }
}

impl<P, K> OrderGenerator<P, K>
where
    P: Producer + 'static,
    K: Codec<Order> + 'static,
{
    /// Publish at the configured rate on a named thread until stopped.
    pub fn spawn(mut self, name: &str) -> GeneratorHandle {
        let running = Arc::new(AtomicBool::new(true));
        let published = Arc::new(AtomicU64::new(0));

        let join = {
            let running = running.clone();
            let published = published.clone();
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    info!(
                        topic = %self.topic,
                        interval_ms = self.interval.as_millis() as u64,
                        "generator started"
                    );
                    while running.load(Ordering::SeqCst) {
                        match self.publish_one() {
                            Ok(_) => {
                                published.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => warn!(error = %e, "failed to generate order"),
                        }
                        sleep_while(&running, self.interval);
                    }
                    info!(published = published.load(Ordering::Relaxed), "generator stopped");
                })
                .expect("failed to spawn generator thread")
        };

        GeneratorHandle {
            running,
            published,
            join: Some(join),
        }
    }
}

fn sleep_while(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(TICK.min(deadline - now));
    }
}

/// Handle to stop a running generator.
#[derive(Debug)]
pub struct GeneratorHandle {
    running: Arc<AtomicBool>,
    published: Arc<AtomicU64>,
    join: Option<thread::JoinHandle<()>>,
}

impl GeneratorHandle {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Stop generating and wait for the thread. Returns the number published.
    pub fn stop(mut self) -> u64 {
        self.running.store(false, Ordering::SeqCst);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.published()
    }
}
