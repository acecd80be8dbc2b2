//! Order status machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The status of an order in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► InventoryReserved ──► PaymentProcessed ──► Completed
///    │               │                     │
///    │               └─────────┬───────────┘
///    │                         ▼
///    │                   Compensating
///    │                         │
///    └─────────────────────────┴──────────────────────► Failed
/// ```
///
/// Re-asserting the current status is always accepted so that a step can be
/// re-executed by its driver without tripping the transition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Order accepted, saga not yet started.
    #[default]
    Pending,

    /// Inventory has been reserved, awaiting payment.
    InventoryReserved,

    /// Payment captured, awaiting confirmation.
    PaymentProcessed,

    /// Order fulfilled (terminal state).
    Completed,

    /// Compensating actions are being executed.
    Compensating,

    /// Order failed, compensation (if any) has run (terminal state).
    Failed,
}

impl OrderStatus {
    /// All statuses, in declaration order.
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::InventoryReserved,
        OrderStatus::PaymentProcessed,
        OrderStatus::Completed,
        OrderStatus::Compensating,
        OrderStatus::Failed,
    ];

    /// Returns the statuses from which `self` may be entered.
    ///
    /// The current status itself is not listed; same-status writes are
    /// handled by [`OrderStatus::can_transition_to`].
    pub fn allowed_predecessors(&self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::Pending => &[],
            OrderStatus::InventoryReserved => &[OrderStatus::Pending],
            OrderStatus::PaymentProcessed => &[OrderStatus::InventoryReserved],
            OrderStatus::Completed => &[OrderStatus::PaymentProcessed],
            OrderStatus::Compensating => &[
                OrderStatus::Pending,
                OrderStatus::InventoryReserved,
                OrderStatus::PaymentProcessed,
            ],
            OrderStatus::Failed => &[
                OrderStatus::Pending,
                OrderStatus::InventoryReserved,
                OrderStatus::PaymentProcessed,
                OrderStatus::Compensating,
            ],
        }
    }

    /// Returns true if the order may move from `self` to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        *self == next || next.allowed_predecessors().contains(self)
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Failed)
    }

    /// Returns the status name as stored and published.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::InventoryReserved => "INVENTORY_RESERVED",
            OrderStatus::PaymentProcessed => "PAYMENT_PROCESSED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Compensating => "COMPENSATING",
            OrderStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown order status: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(OrderStatus::default(), OrderStatus::Pending);
    }

    #[test]
    fn test_forward_path() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::InventoryReserved));
        assert!(OrderStatus::InventoryReserved.can_transition_to(OrderStatus::PaymentProcessed));
        assert!(OrderStatus::PaymentProcessed.can_transition_to(OrderStatus::Completed));
    }

    #[test]
    fn test_cannot_skip_stages_except_into_failed() {
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::PaymentProcessed));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Completed));
        assert!(!OrderStatus::InventoryReserved.can_transition_to(OrderStatus::Completed));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Failed));
        assert!(OrderStatus::PaymentProcessed.can_transition_to(OrderStatus::Failed));
    }

    #[test]
    fn test_never_moves_backward() {
        assert!(!OrderStatus::PaymentProcessed.can_transition_to(OrderStatus::InventoryReserved));
        assert!(!OrderStatus::Compensating.can_transition_to(OrderStatus::PaymentProcessed));
        assert!(!OrderStatus::InventoryReserved.can_transition_to(OrderStatus::Pending));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for next in OrderStatus::ALL {
            if next != OrderStatus::Completed {
                assert!(!OrderStatus::Completed.can_transition_to(next), "{next}");
            }
            if next != OrderStatus::Failed {
                assert!(!OrderStatus::Failed.can_transition_to(next), "{next}");
            }
        }
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Compensating.is_terminal());
    }

    #[test]
    fn test_same_status_is_accepted() {
        for status in OrderStatus::ALL {
            assert!(status.can_transition_to(status));
        }
    }

    #[test]
    fn test_compensating_only_leads_to_failed() {
        let reachable: Vec<_> = OrderStatus::ALL
            .into_iter()
            .filter(|next| *next != OrderStatus::Compensating)
            .filter(|next| OrderStatus::Compensating.can_transition_to(*next))
            .collect();
        assert_eq!(reachable, vec![OrderStatus::Failed]);
    }

    #[test]
    fn test_string_round_trip() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("SHIPPED".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_serialization_uses_wire_names() {
        let json = serde_json::to_string(&OrderStatus::InventoryReserved).unwrap();
        assert_eq!(json, "\"INVENTORY_RESERVED\"");
    }
}
