use domain::OrderError;
use store::StoreError;
use thiserror::Error;

/// Errors from the create-order command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command failed validation. Never retried.
    #[error("Validation error: {0}")]
    Validation(#[from] OrderError),

    /// The atomic order + outbox write failed. Safe to retry.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// The outbox payload could not be built.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CommandError {
    /// Returns true if the caller may retry the same command.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommandError::Persistence(_))
    }
}

/// Errors from the idempotency layer, wrapping the handler's own error `E`.
#[derive(Debug, Error)]
pub enum IdempotencyError<E> {
    /// The layer requires a key and none was supplied.
    #[error("Missing idempotency key")]
    KeyRequired,

    /// The supplied key is empty, too long or contains control characters.
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    /// Another request with the same key is still running.
    #[error("A request with idempotency key {key} is already in progress")]
    DuplicateInFlight { key: String },

    /// The key was first used with a different request body.
    #[error("Idempotency key {key} was used with a different payload")]
    PayloadMismatch { key: String },

    /// The idempotency store failed.
    #[error("Idempotency store error: {0}")]
    Store(#[from] StoreError),

    /// The request or stored response could not be (de)serialized.
    #[error("Idempotency serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    /// The wrapped handler failed; the key was released.
    #[error(transparent)]
    Handler(E),
}
