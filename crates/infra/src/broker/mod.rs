//! Network broker transports.
//!
//! The broker abstraction (`Consumer`, `Producer`) and the in-memory broker
//! live in `orderflow-events` as pure mechanics. This module provides
//! infrastructure-backed implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConsumer, RedisStreamsError, RedisStreamsProducer};
