//! State carried from step to step.

use common::AggregateId;
use domain::{CustomerId, Money, OrderCreatedPayload, OrderItem};
use serde::{Deserialize, Serialize};

use crate::compensation::CompensationStack;

/// Result of the notification step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Sent { notification_id: String },
    Failed { reason: String },
}

/// The document a saga execution threads through its steps.
///
/// It starts as the `ORDER_CREATED` payload and accumulates the
/// correlation ids of every acquired effect together with their undo
/// entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaContext {
    pub order_id: AggregateId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
    pub total_amount: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationStatus>,
    #[serde(default)]
    pub compensation: CompensationStack,
}

impl SagaContext {
    /// Reads the context from a workflow execution input.
    pub fn from_input(input: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value::<OrderCreatedPayload>(input).map(Self::from)
    }
}

impl From<OrderCreatedPayload> for SagaContext {
    fn from(payload: OrderCreatedPayload) -> Self {
        Self {
            order_id: payload.order_id,
            customer_id: payload.customer_id,
            items: payload.items,
            total_amount: payload.total_amount,
            reservation_id: None,
            payment_id: None,
            notification: None,
            compensation: CompensationStack::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use domain::{Order, OutboxEvent};

    use super::*;

    #[test]
    fn context_from_order_created_event() {
        let order = Order::new(
            AggregateId::new(),
            CustomerId::from("cust-1"),
            vec![OrderItem::new("SKU-001", 3, Money::from_cents(1000))],
            Utc::now(),
        )
        .unwrap();
        let event = OutboxEvent::order_created(&order).unwrap();

        let context = SagaContext::from_input(event.payload).unwrap();

        assert_eq!(context.order_id, order.order_id());
        assert_eq!(context.customer_id.as_str(), "cust-1");
        assert_eq!(context.total_amount, Money::from_cents(3000));
        assert!(context.reservation_id.is_none());
        assert!(context.compensation.is_empty());
    }

    #[test]
    fn invalid_input_is_rejected() {
        assert!(SagaContext::from_input(serde_json::json!({"order_id": 1})).is_err());
    }
}
