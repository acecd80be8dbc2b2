//! Order aggregate and related types.

mod aggregate;
mod commands;
mod state;
mod value_objects;

pub use aggregate::Order;
pub use commands::{CreateOrder, CreateOrderItem, ValidatedOrder};
pub use state::OrderStatus;
pub use value_objects::{CustomerId, Money, OrderItem, ProductId};

use thiserror::Error;

/// Errors that can occur during order operations.
///
/// Every variant except `InvalidStateTransition` is a validation failure of
/// caller input and must never be retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// Customer ID is required.
    #[error("customerId is required")]
    CustomerIdRequired,

    /// Order has no items.
    #[error("items must be a non-empty list")]
    NoItems,

    /// A line item has no product ID.
    #[error("Item {index} is missing a productId")]
    ProductIdRequired { index: usize },

    /// Invalid quantity.
    #[error("Invalid quantity for {product_id}: {quantity} (must be greater than 0)")]
    InvalidQuantity { product_id: String, quantity: i64 },

    /// Invalid price.
    #[error("Invalid price for {product_id}: {price} (must not be negative)")]
    InvalidPrice { product_id: String, price: i64 },

    /// The order total does not fit the money representation.
    #[error("Order total overflows")]
    AmountOverflow,

    /// Order is not in a state that allows the requested transition.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStateTransition { from: OrderStatus, to: OrderStatus },
}

impl OrderError {
    /// Returns true if this error describes bad caller input.
    pub fn is_validation(&self) -> bool {
        !matches!(self, OrderError::InvalidStateTransition { .. })
    }
}
