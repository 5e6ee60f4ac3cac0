//! Messages, broker capabilities and payload codecs.
//!
//! The pipeline core only talks to the broker through the [`Consumer`] and
//! [`Producer`] traits defined here; [`InMemoryBroker`] is the reference
//! implementation used in tests and local runs.

pub mod attempt;
pub mod broker;
pub mod codec;
pub mod in_memory_broker;
pub mod message;

pub use attempt::{AttemptCount, RETRIES_HEADER};
pub use broker::{BrokerError, CommitCallback, Consumer, DeliveryCallback, PollError, Producer};
pub use codec::{Codec, CodecError, JsonOrderCodec};
pub use in_memory_broker::{InMemoryBroker, InMemoryConsumer, InMemoryProducer};
pub use message::{
    DeliveryReport, Header, Headers, Message, Offset, OutgoingMessage, SourcePosition,
};
