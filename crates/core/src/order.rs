//! The order record carried on the primary topic.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::OrderId;
use crate::value_object::ValueObject;

/// A single order event: which category was bought and for how much.
///
/// Field names on the wire follow the original record schema
/// (`orderId`, `product`, `price`). Any string id and category are accepted
/// off the wire, as is any finite price, negative ones included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "OrderRecord")]
pub struct Order {
    #[serde(rename = "orderId")]
    id: OrderId,
    #[serde(rename = "product")]
    category: String,
    #[serde(rename = "price")]
    amount: f64,
}

impl ValueObject for Order {}

impl Order {
    /// Build an order. `amount` must be finite: a NaN or infinity would
    /// poison every running average it touches.
    pub fn new(id: OrderId, category: impl Into<String>, amount: f64) -> DomainResult<Self> {
        if !amount.is_finite() {
            return Err(DomainError::validation(format!("amount must be finite, got {amount}")));
        }

        Ok(Self {
            id,
            category: category.into(),
            amount,
        })
    }

    pub fn id(&self) -> &OrderId {
        &self.id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }
}

/// Unvalidated wire shape of an [`Order`].
#[derive(Debug, Deserialize)]
struct OrderRecord {
    #[serde(rename = "orderId")]
    id: String,
    #[serde(rename = "product")]
    category: String,
    #[serde(rename = "price")]
    amount: f64,
}

impl TryFrom<OrderRecord> for Order {
    type Error = DomainError;

    fn try_from(record: OrderRecord) -> Result<Self, Self::Error> {
        Order::new(OrderId::from_record(record.id), record.category, record.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> OrderId {
        OrderId::new(s).unwrap()
    }

    #[test]
    fn valid_order_exposes_fields() {
        let order = Order::new(id("o1"), "mouse", 25.0).unwrap();
        assert_eq!(order.id().as_str(), "o1");
        assert_eq!(order.category(), "mouse");
        assert_eq!(order.amount(), 25.0);
    }

    #[test]
    fn rejects_non_finite_amounts() {
        let err = Order::new(id("o1"), "mouse", f64::NAN).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(Order::new(id("o1"), "mouse", f64::INFINITY).is_err());
    }

    #[test]
    fn accepts_negative_amounts_and_empty_category() {
        assert_eq!(Order::new(id("o1"), "mouse", -0.5).unwrap().amount(), -0.5);
        assert_eq!(Order::new(id("o1"), "", 1.0).unwrap().category(), "");
    }

    #[test]
    fn uses_schema_field_names_on_the_wire() {
        let order = Order::new(id("o1"), "dock", 99.5).unwrap();
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"orderId": "o1", "product": "dock", "price": 99.5})
        );
    }

    #[test]
    fn deserialization_accepts_any_record_values() {
        let refund = r#"{"orderId":"r1","product":"mouse","price":-5.0}"#;
        assert_eq!(serde_json::from_str::<Order>(refund).unwrap().amount(), -5.0);

        let blank = r#"{"orderId":"","product":"","price":1.0}"#;
        let order = serde_json::from_str::<Order>(blank).unwrap();
        assert_eq!(order.id().as_str(), "");
        assert_eq!(order.category(), "");
    }
}
