//! Create-order command handler.

use chrono::Utc;
use common::AggregateId;
use domain::{CreateOrder, Money, Order, OrderStatus, OutboxEvent};
use serde::{Deserialize, Serialize};
use store::OrderStore;

use crate::error::CommandError;

/// Message returned with every successfully created order.
pub const ORDER_CREATED_MESSAGE: &str = "Order created successfully";

/// Response of a successful create-order command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderResponse {
    pub order_id: AggregateId,
    pub status: OrderStatus,
    pub total_amount: Money,
    pub message: String,
}

impl From<&Order> for CreateOrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id(),
            status: order.status(),
            total_amount: order.total_amount(),
            message: ORDER_CREATED_MESSAGE.to_string(),
        }
    }
}

/// Accepts create-order commands and writes the order together with its
/// `ORDER_CREATED` outbox event.
pub struct OrderCommandHandler<S: OrderStore> {
    store: S,
}

impl<S: OrderStore> OrderCommandHandler<S> {
    /// Creates a new handler over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validates the command and atomically persists the new `PENDING`
    /// order and its `ORDER_CREATED` event.
    ///
    /// On a persistence failure nothing is visible and the command may be
    /// retried.
    #[tracing::instrument(skip(self, cmd))]
    pub async fn create_order(&self, cmd: CreateOrder) -> Result<CreateOrderResponse, CommandError> {
        let validated = cmd.validate().inspect_err(|e| {
            tracing::warn!(error = %e, "create order rejected");
        })?;

        let order = Order::new(
            AggregateId::new(),
            validated.customer_id,
            validated.items,
            Utc::now(),
        )?;
        let event = OutboxEvent::order_created(&order)?;

        self.store.create_order(&order, &event).await.inspect_err(|e| {
            tracing::error!(order_id = %order.order_id(), error = %e, "failed to persist order");
            metrics::counter!("order_persistence_failures_total").increment(1);
        })?;

        tracing::info!(
            order_id = %order.order_id(),
            event_id = %event.event_id,
            total_amount = order.total_amount().cents(),
            "order created"
        );
        metrics::counter!("orders_created_total").increment(1);

        Ok(CreateOrderResponse::from(&order))
    }
}

#[cfg(test)]
mod tests {
    use domain::{CreateOrderItem, EventType, OrderCreatedPayload, OrderError};
    use store::{InMemoryStore, OutboxStore};

    use super::*;

    fn command() -> CreateOrder {
        CreateOrder::new(
            "cust-1",
            vec![
                CreateOrderItem::new("SKU-001", 2, 1999),
                CreateOrderItem::new("SKU-002", 1, 500),
            ],
        )
    }

    #[tokio::test]
    async fn creates_order_and_outbox_event() {
        let store = InMemoryStore::new();
        let handler = OrderCommandHandler::new(store.clone());

        let response = handler.create_order(command()).await.unwrap();

        assert_eq!(response.status, OrderStatus::Pending);
        assert_eq!(response.total_amount, Money::from_cents(4498));
        assert_eq!(response.message, ORDER_CREATED_MESSAGE);

        let order = store.get_order(response.order_id).await.unwrap().unwrap();
        assert_eq!(order.status(), OrderStatus::Pending);

        let events = store.events_for_aggregate(response.order_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::OrderCreated);
        assert!(!events[0].processed);

        let payload: OrderCreatedPayload = events[0].payload_as().unwrap();
        assert_eq!(payload.order_id, response.order_id);
        assert_eq!(payload.total_amount, response.total_amount);
        assert_eq!(payload.items.len(), 2);
    }

    #[tokio::test]
    async fn rejects_invalid_command_without_writing() {
        let store = InMemoryStore::new();
        let handler = OrderCommandHandler::new(store.clone());

        let err = handler
            .create_order(CreateOrder::new("cust-1", vec![]))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Validation(OrderError::NoItems)));
        assert!(!err.is_retryable());
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn outbox_failure_leaves_neither_record() {
        let store = InMemoryStore::new();
        store.set_fail_outbox_insert(true).await;
        let handler = OrderCommandHandler::new(store.clone());

        let err = handler.create_order(command()).await.unwrap_err();

        assert!(matches!(err, CommandError::Persistence(_)));
        assert!(err.is_retryable());
        assert_eq!(store.order_count().await, 0);
        assert_eq!(store.event_count().await, 0);

        store.set_fail_outbox_insert(false).await;
        handler.create_order(command()).await.unwrap();
        assert_eq!(store.order_count().await, 1);
        assert_eq!(store.event_count().await, 1);
    }

    #[test]
    fn response_serializes_with_wire_names() {
        let response = CreateOrderResponse {
            order_id: AggregateId::new(),
            status: OrderStatus::Pending,
            total_amount: Money::from_cents(100),
            message: ORDER_CREATED_MESSAGE.to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["total_amount"], 100);
        assert_eq!(json["message"], "Order created successfully");
    }
}
