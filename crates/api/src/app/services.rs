//! Pipeline wiring: config → transport → routers → consume loop.
//!
//! The generic [`wire_consume_loop`] works over any broker client; the
//! binaries use the Redis Streams transport, tests use the in-memory broker.

use std::sync::Arc;

use tracing::info;

use orderflow_events::{Consumer, Producer};
use orderflow_infra::broker::{RedisStreamsConsumer, RedisStreamsError, RedisStreamsProducer};
use orderflow_infra::{
    Aggregator, ConsumeLoop, DeadLetterJournal, DeadLetterRouter, FaultInjector, GeneratorHandle,
    LoopStats, OrderGenerator, OrderProcessor, PipelineConfig, RetryRouter, ShutdownHandle,
};

/// Read side of a running consume loop.
#[derive(Debug, Clone)]
pub struct ConsumerProbe {
    pub handle: ShutdownHandle,
    pub stats: Arc<LoopStats>,
}

/// State shared with the HTTP handlers.
#[derive(Debug, Clone)]
pub struct StatsState {
    pub aggregator: Arc<Aggregator>,
    pub journal: Arc<DeadLetterJournal>,
    pub consumer: Option<ConsumerProbe>,
}

impl StatsState {
    /// State with no consume loop attached.
    pub fn detached(aggregator: Arc<Aggregator>, journal: Arc<DeadLetterJournal>) -> Self {
        Self {
            aggregator,
            journal,
            consumer: None,
        }
    }
}

/// Build a consume loop over `consumer`, publishing retries and dead letters
/// through `producer`.
pub fn wire_consume_loop<C, P>(
    config: &PipelineConfig,
    consumer: C,
    producer: P,
) -> (ConsumeLoop<C, P, P>, StatsState)
where
    C: Consumer + 'static,
    P: Producer + Clone,
{
    let aggregator = Arc::new(Aggregator::new());
    let journal = Arc::new(DeadLetterJournal::new());

    let mut processor = OrderProcessor::json(aggregator.clone());
    if config.simulated_failure_rate > 0.0 {
        info!(
            rate = config.simulated_failure_rate,
            "simulated processing failures enabled"
        );
        processor = processor.with_faults(FaultInjector::new(config.simulated_failure_rate));
    }

    let router = RetryRouter::new(
        config.retry_policy(),
        config.topics.retry.clone(),
        producer.clone(),
        DeadLetterRouter::new(producer, config.topics.dead_letter.clone()),
    )
    .with_journal(journal.clone());

    let consume_loop = ConsumeLoop::new(consumer, processor, router, config.loop_config());
    let state = StatsState {
        aggregator,
        journal,
        consumer: Some(ConsumerProbe {
            handle: consume_loop.shutdown_handle(),
            stats: consume_loop.stats(),
        }),
    };

    (consume_loop, state)
}

pub type RedisConsumeLoop =
    ConsumeLoop<RedisStreamsConsumer, Arc<RedisStreamsProducer>, Arc<RedisStreamsProducer>>;

fn connect_producer(
    config: &PipelineConfig,
    client_id: &str,
) -> Result<RedisStreamsProducer, RedisStreamsError> {
    RedisStreamsProducer::connect(
        &config.bootstrap,
        client_id,
        config.producer.acks,
        config.producer.idempotent,
    )
}

/// Consume loop over Redis Streams, as run by `orderflow-consumer`.
pub fn redis_consume_loop(
    config: &PipelineConfig,
) -> Result<(RedisConsumeLoop, StatsState), RedisStreamsError> {
    let consumer = RedisStreamsConsumer::connect(
        &config.bootstrap,
        config.consumer.group_id.clone(),
        config.consumer.client_id.clone(),
        config.consumer.max_poll_records,
    )?;
    let producer = Arc::new(connect_producer(
        config,
        &format!("{}-router", config.consumer.client_id),
    )?);

    info!(
        bootstrap = %config.bootstrap,
        group = %config.consumer.group_id,
        orders = %config.topics.orders,
        retry = %config.topics.retry,
        dead_letter = %config.topics.dead_letter,
        max_attempts = config.retry.max_attempts,
        "consumer pipeline wired"
    );

    Ok(wire_consume_loop(config, consumer, producer))
}

/// Start the synthetic order generator over Redis Streams.
pub fn start_redis_generator(
    config: &PipelineConfig,
) -> Result<GeneratorHandle, RedisStreamsError> {
    let producer = connect_producer(config, &config.producer.client_id)?;
    let generator = OrderGenerator::new(
        producer,
        config.topics.orders.clone(),
        config.generator.interval(),
    );
    Ok(generator.spawn("order-generator"))
}
