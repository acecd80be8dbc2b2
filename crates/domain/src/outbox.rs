//! Outbox events and their payloads.
//!
//! An [`OutboxEvent`] is written in the same atomic unit as the state change
//! that defines it. Its content never changes afterwards; only the
//! `processed` flag flips from false to true, exactly once.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{AggregateId, EventId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::order::{CustomerId, Money, Order, OrderItem};

/// The closed set of outbox event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    OrderCreated,
    InventoryReserved,
    InventoryReservationFailed,
    PaymentProcessed,
    PaymentFailed,
    NotificationSent,
    NotificationFailed,
    SagaFailed,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::OrderCreated,
        EventType::InventoryReserved,
        EventType::InventoryReservationFailed,
        EventType::PaymentProcessed,
        EventType::PaymentFailed,
        EventType::NotificationSent,
        EventType::NotificationFailed,
        EventType::SagaFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "ORDER_CREATED",
            EventType::InventoryReserved => "INVENTORY_RESERVED",
            EventType::InventoryReservationFailed => "INVENTORY_RESERVATION_FAILED",
            EventType::PaymentProcessed => "PAYMENT_PROCESSED",
            EventType::PaymentFailed => "PAYMENT_FAILED",
            EventType::NotificationSent => "NOTIFICATION_SENT",
            EventType::NotificationFailed => "NOTIFICATION_FAILED",
            EventType::SagaFailed => "SAGA_FAILED",
        }
    }

    /// Returns true if events of this type start a saga execution rather
    /// than being published on the event bus.
    pub fn starts_saga(&self) -> bool {
        matches!(self, EventType::OrderCreated)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// A domain event recorded in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub event_type: EventType,
    /// Opaque JSON document whose schema depends on `event_type`.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
}

impl OutboxEvent {
    /// Creates a new unprocessed event with a fresh id.
    pub fn new<P: Serialize>(
        aggregate_id: AggregateId,
        event_type: EventType,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: EventId::new(),
            aggregate_id,
            event_type,
            payload: serde_json::to_value(payload)?,
            created_at: Utc::now(),
            processed: false,
        })
    }

    /// Builds the `ORDER_CREATED` event that accompanies a new order.
    pub fn order_created(order: &Order) -> Result<Self, serde_json::Error> {
        let mut event = Self::new(
            order.order_id(),
            EventType::OrderCreated,
            &OrderCreatedPayload::from(order),
        )?;
        event.created_at = order.created_at();
        Ok(event)
    }

    /// Deserializes the payload into its typed form.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Payload of `ORDER_CREATED`: the creation facts of the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreatedPayload {
    pub order_id: AggregateId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
    pub total_amount: Money,
    pub timestamp: DateTime<Utc>,
}

impl From<&Order> for OrderCreatedPayload {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id(),
            customer_id: order.customer_id().clone(),
            items: order.items().to_vec(),
            total_amount: order.total_amount(),
            timestamp: order.created_at(),
        }
    }
}

/// Payload of `INVENTORY_RESERVED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReservedPayload {
    pub order_id: AggregateId,
    pub reservation_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Payload of `PAYMENT_PROCESSED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProcessedPayload {
    pub order_id: AggregateId,
    pub payment_id: String,
    pub amount: Money,
    pub timestamp: DateTime<Utc>,
}

/// Payload of `NOTIFICATION_SENT` and `NOTIFICATION_FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub order_id: AggregateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Payload of `INVENTORY_RESERVATION_FAILED` and `PAYMENT_FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailedPayload {
    pub order_id: AggregateId,
    pub step: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Payload of `SAGA_FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaFailedPayload {
    pub order_id: AggregateId,
    pub reason: String,
    /// One description per compensation outcome, in execution order.
    pub compensations: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
