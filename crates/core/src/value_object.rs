//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**: two orders with
/// the same id, category and amount are the same order as far as the pipeline
/// is concerned. To "modify" one, build a new value.
///
/// The trait requires:
/// - **Clone**: values are copied out of messages and into logs freely
/// - **PartialEq**: comparison is by attribute values
/// - **Debug**: values appear in logs and test failures
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
