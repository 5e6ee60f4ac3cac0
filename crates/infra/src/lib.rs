//! Pipeline layer: aggregation, retry/dead-letter routing, the consume loop,
//! configuration and broker transports.

pub mod aggregator;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod generator;
pub mod processor;
pub mod retry;


pub use aggregator::{AggregateSnapshot, Aggregator, CategorySnapshot, ProductStatistic};
pub use config::{
    Acks, ConfigError, ConsumerSettings, GeneratorConfig, PipelineConfig, ProducerSettings,
    RetryConfig, StatsServerConfig, TopicConfig,
};
pub use consumer::{
    ConsumeError, ConsumeLoop, ConsumerWorker, LoopConfig, LoopState, LoopStats, LoopStatsSnapshot,
    ShutdownHandle,
};
pub use dead_letter::{DeadLetterEvent, DeadLetterJournal, DeadLetterRouter};
pub use generator::{CATEGORIES, GenerateError, GeneratorHandle, OrderGenerator};
pub use processor::{FaultInjector, OrderProcessor, ProcessedOrder, ProcessingError};
pub use retry::{RetryOutcome, RetryPolicy, RetryRouter, Sleeper};
