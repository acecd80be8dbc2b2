use store::StoreError;
use thiserror::Error;

/// Errors that can occur while relaying outbox events.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A workflow execution with this name was already started.
    #[error("Execution already exists: {0}")]
    ExecutionAlreadyExists(String),

    /// The workflow engine rejected or failed the start request.
    #[error("Workflow engine error: {0}")]
    Engine(String),

    /// The event bus failed to accept the event.
    #[error("Event bus error: {0}")]
    Bus(String),

    /// A store error occurred.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
