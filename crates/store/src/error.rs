use common::{AggregateId, EventId};
use domain::OrderStatus;
use thiserror::Error;

/// Errors that can occur when interacting with the stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The order was not found.
    #[error("Order not found: {0}")]
    OrderNotFound(AggregateId),

    /// The outbox event was not found.
    #[error("Outbox event not found: {0}")]
    EventNotFound(EventId),

    /// A conditional status write did not match: the order's current status
    /// is not an allowed predecessor of the requested one.
    #[error("Order {order_id} cannot move to {to} from {current}")]
    ConditionFailed {
        order_id: AggregateId,
        current: OrderStatus,
        to: OrderStatus,
    },

    /// A record with the same key already exists.
    #[error("Duplicate key: {0}")]
    Duplicate(String),

    /// A persisted row could not be mapped back to a domain value.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A failure injected by the in-memory store.
    #[error("Injected failure: {0}")]
    Injected(&'static str),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
