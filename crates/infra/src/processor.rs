//! Per-message processing: decode, then aggregate.

use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use orderflow_core::Order;
use orderflow_events::{Codec, CodecError, JsonOrderCodec, Message};

use crate::aggregator::Aggregator;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("simulated transient failure for order {0}")]
    Simulated(String),
}

/// Fails a configurable fraction of orders with [`ProcessingError::Simulated`].
#[derive(Debug)]
pub struct FaultInjector {
    rate: f64,
    rng: Mutex<StdRng>,
}

impl FaultInjector {
    /// `rate` is clamped to `[0, 1]`.
    pub fn new(rate: f64) -> Self {
        Self::from_rng(rate, StdRng::from_entropy())
    }

    pub fn with_seed(rate: f64, seed: u64) -> Self {
        Self::from_rng(rate, StdRng::seed_from_u64(seed))
    }

    fn from_rng(rate: f64, rng: StdRng) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        Self {
            rate,
            rng: Mutex::new(rng),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn should_fail(&self) -> bool {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_bool(self.rate)
    }
}

/// Result of a successfully processed message.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedOrder {
    pub order: Order,
    /// Category average after this order was applied.
    pub average: f64,
}

/// Decodes order messages and feeds them to the shared [`Aggregator`].
#[derive(Debug)]
pub struct OrderProcessor<K = JsonOrderCodec> {
    codec: K,
    aggregator: Arc<Aggregator>,
    faults: Option<FaultInjector>,
}

impl OrderProcessor<JsonOrderCodec> {
    pub fn json(aggregator: Arc<Aggregator>) -> Self {
        Self::new(JsonOrderCodec, aggregator)
    }
}

impl<K: Codec<Order>> OrderProcessor<K> {
    pub fn new(codec: K, aggregator: Arc<Aggregator>) -> Self {
        Self {
            codec,
            aggregator,
            faults: None,
        }
    }

    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = Some(faults);
        self
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Decode `message` and apply it to the aggregate.
    ///
    /// A simulated failure is raised after decoding and before the aggregate
    /// is touched, so a failed message never counts.
    pub fn process(&self, message: &Message) -> Result<ProcessedOrder, ProcessingError> {
        let order = self.codec.decode(message.value())?;

        if self.faults.as_ref().is_some_and(FaultInjector::should_fail) {
            return Err(ProcessingError::Simulated(order.id().to_string()));
        }

        let average = self.aggregator.update_average(order.category(), order.amount());
        Ok(ProcessedOrder { order, average })
    }
}
