//! Saga error types.

use std::time::Duration;

use common::AggregateId;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A business capability (inventory, payment, notification) reported failure.
    #[error("{capability} service failed: {reason}")]
    CapabilityFailure {
        capability: &'static str,
        reason: String,
    },

    /// A compensating action failed.
    #[error("Compensation step '{step}' failed: {reason}")]
    CompensationFailed { step: String, reason: String },

    /// A step did not finish within the configured timeout.
    #[error("Step '{step}' timed out after {}ms", .after.as_millis())]
    Timeout { step: String, after: Duration },

    /// The order the saga runs for does not exist.
    #[error("Order not found: {0}")]
    OrderNotFound(AggregateId),

    /// The saga task ended without producing an outcome.
    #[error("Saga execution aborted: {0}")]
    Aborted(String),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Builds a capability failure.
    pub fn capability(capability: &'static str, reason: impl Into<String>) -> Self {
        Self::CapabilityFailure {
            capability,
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
