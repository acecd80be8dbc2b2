//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use command::{CommandError, IdempotencyError};
use relay::RelayError;
use store::StoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Order creation failed, either in the idempotency layer or the handler.
    Command(IdempotencyError<CommandError>),
    /// Store error outside the command path.
    Store(StoreError),
    /// Relay error while redriving an event.
    Relay(RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Command(err) => command_error_to_response(err),
            ApiError::Store(err) => store_error_to_response(err),
            ApiError::Relay(RelayError::Store(err)) => store_error_to_response(err),
            ApiError::Relay(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn command_error_to_response(err: IdempotencyError<CommandError>) -> (StatusCode, String) {
    match &err {
        IdempotencyError::KeyRequired | IdempotencyError::InvalidKey(_) => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        IdempotencyError::DuplicateInFlight { .. } => (StatusCode::CONFLICT, err.to_string()),
        IdempotencyError::PayloadMismatch { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
        IdempotencyError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        IdempotencyError::Serialization(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        IdempotencyError::Handler(CommandError::Validation(_)) => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        IdempotencyError::Handler(CommandError::Persistence(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        IdempotencyError::Handler(CommandError::Serialization(_)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn store_error_to_response(err: StoreError) -> (StatusCode, String) {
    match &err {
        StoreError::OrderNotFound(_) | StoreError::EventNotFound(_) => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        StoreError::ConditionFailed { .. } | StoreError::Duplicate(_) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        StoreError::Corrupt(_) | StoreError::Serialization(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        _ => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}

impl From<IdempotencyError<CommandError>> for ApiError {
    fn from(err: IdempotencyError<CommandError>) -> Self {
        ApiError::Command(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        ApiError::Relay(err)
    }
}
