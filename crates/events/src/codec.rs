//! Payload codecs.
//!
//! The pipeline treats payload encoding as opaque: it hands raw bytes to a
//! [`Codec`] and gets a domain record (or a [`CodecError`]) back.

use thiserror::Error;

use orderflow_core::Order;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("failed to decode record: {0}")]
    Decode(String),
}

/// Encodes and decodes records of type `T`.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, record: &T) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, raw: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec for [`Order`] using the order record field names
/// (`orderId`, `product`, `price`).
///
/// Only structurally invalid payloads fail to decode; blank strings and
/// negative prices are valid records.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonOrderCodec;

impl Codec<Order> for JsonOrderCodec {
    fn encode(&self, record: &Order) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(record).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, raw: &[u8]) -> Result<Order, CodecError> {
        serde_json::from_slice(raw).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
