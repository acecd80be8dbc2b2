//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};

use super::{CustomerId, Money, OrderError, OrderItem, OrderStatus};

/// Order aggregate root.
///
/// The current-state record of an order. Items and total are fixed at
/// creation; afterwards only the status (and its timestamp) moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    order_id: AggregateId,
    customer_id: CustomerId,
    items: Vec<OrderItem>,
    total_amount: Money,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates a new `PENDING` order, computing its total from the items.
    ///
    /// Fails if there are no items or the total overflows.
    pub fn new(
        order_id: AggregateId,
        customer_id: CustomerId,
        items: Vec<OrderItem>,
        now: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        if items.is_empty() {
            return Err(OrderError::NoItems);
        }

        let total_amount = items.iter().try_fold(Money::zero(), |total, item| {
            item.total_price()
                .and_then(|line| total.checked_add(line))
                .ok_or(OrderError::AmountOverflow)
        })?;

        Ok(Self {
            order_id,
            customer_id,
            items,
            total_amount,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    /// Restores an order from persisted fields without recomputing anything.
    pub fn from_parts(
        order_id: AggregateId,
        customer_id: CustomerId,
        items: Vec<OrderItem>,
        total_amount: Money,
        status: OrderStatus,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id,
            customer_id,
            items,
            total_amount,
            status,
            created_at,
            updated_at,
        }
    }

    pub fn order_id(&self) -> AggregateId {
        self.order_id
    }

    pub fn customer_id(&self) -> &CustomerId {
        &self.customer_id
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns true if the order is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the order to `next`, enforcing the transition graph.
    pub fn transition_to(&mut self, next: OrderStatus, at: DateTime<Utc>) -> Result<(), OrderError> {
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }
}
