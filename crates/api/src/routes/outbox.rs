//! Operator endpoints for surfaced outbox events.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::EventId;
use relay::RecordOutcome;
use store::{FailedEvent, OutboxStore};

use crate::error::ApiError;
use crate::{AppState, AppStore};

/// GET /outbox/failed — unprocessed events that reached the relay's
/// attempt limit.
#[tracing::instrument(skip(state))]
pub async fn failed<S: AppStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<Vec<FailedEvent>>, ApiError> {
    let min_attempts = state.relay.config().max_attempts;
    let events = state.store.failed_events(min_attempts).await?;
    Ok(Json(events))
}

/// POST /outbox/failed/{event_id}/redrive — dispatch a stored event again.
#[tracing::instrument(skip(state))]
pub async fn redrive<S: AppStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(event_id): Path<String>,
) -> Result<Json<RecordOutcome>, ApiError> {
    let event_id = EventId::parse(&event_id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid event ID format: {e}")))?;

    let outcome = state.relay.redrive(event_id).await?;
    tracing::info!(%event_id, ?outcome, "event redriven");
    Ok(Json(outcome))
}
