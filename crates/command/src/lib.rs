//! Command side of the order service.
//!
//! - [`OrderCommandHandler`] validates a create-order command and writes the
//!   order and its `ORDER_CREATED` outbox event as one atomic unit
//! - [`IdempotencyLayer`] wraps any handler with key-based deduplication

pub mod error;
pub mod handler;
pub mod idempotency;

pub use error::{CommandError, IdempotencyError};
pub use handler::{CreateOrderResponse, ORDER_CREATED_MESSAGE, OrderCommandHandler};
pub use idempotency::{
    DEFAULT_EXPIRES_AFTER_SECS, DEFAULT_KEY_HEADER, IdempotencyConfig, IdempotencyLayer,
    IdempotentResponse, fingerprint,
};
