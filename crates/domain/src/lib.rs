//! Domain layer for the order outbox and saga services.
//!
//! This crate holds the pure domain types, free of any I/O:
//! - `Order` aggregate with its immutable total and status machine
//! - `OutboxEvent` and the closed `EventType` enumeration with typed payloads
//! - `CreateOrder` command and its validation rules

pub mod order;
pub mod outbox;

pub use order::{
    CreateOrder, CreateOrderItem, CustomerId, Money, Order, OrderError, OrderItem, OrderStatus,
    ProductId, ValidatedOrder,
};
pub use outbox::{
    EventType, InventoryReservedPayload, NotificationPayload, OrderCreatedPayload, OutboxEvent,
    PaymentProcessedPayload, SagaFailedPayload, StepFailedPayload,
};
