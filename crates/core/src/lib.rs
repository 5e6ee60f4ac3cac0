//! `orderflow-core`: domain building blocks for the order pipeline.
//!
//! This crate contains **pure domain** types (no broker, codec or IO concerns).

pub mod error;
pub mod id;
pub mod order;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use id::OrderId;
pub use order::Order;
pub use value_object::ValueObject;
