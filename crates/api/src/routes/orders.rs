//! Order creation and inspection endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use command::CreateOrderResponse;
use common::AggregateId;
use domain::{CreateOrder, Order, OutboxEvent};
use store::{OrderStore, OutboxStore};

use crate::error::ApiError;
use crate::{AppState, AppStore};

/// Set to `true` on a response replayed from an idempotency record.
pub const REPLAYED_HEADER: &str = "x-idempotent-replayed";

/// POST /orders — create an order and its `ORDER_CREATED` event.
///
/// A request carrying the idempotency key header is executed at most once
/// per key; repeats receive the original response.
#[tracing::instrument(skip(state, headers, cmd))]
pub async fn create<S: AppStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Json(cmd): Json<CreateOrder>,
) -> Result<(StatusCode, HeaderMap, Json<CreateOrderResponse>), ApiError> {
    let key = match headers.get(state.idempotency.config().key_header.as_str()) {
        Some(value) => Some(value.to_str().map_err(|_| {
            ApiError::BadRequest("Idempotency key must be visible ASCII".to_string())
        })?),
        None => None,
    };

    let result = state
        .idempotency
        .execute(key, &cmd, || state.commands.create_order(cmd.clone()))
        .await?;

    let mut response_headers = HeaderMap::new();
    if result.replayed {
        response_headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    }

    Ok((StatusCode::CREATED, response_headers, Json(result.response)))
}

/// GET /orders/{id} — current state of one order.
#[tracing::instrument(skip(state))]
pub async fn get<S: AppStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state
        .store
        .get_order(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order not found: {order_id}")))?;

    Ok(Json(order))
}

/// GET /orders/{id}/events — the order's outbox events in creation order.
#[tracing::instrument(skip(state))]
pub async fn events<S: AppStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<OutboxEvent>>, ApiError> {
    let order_id = parse_order_id(&id)?;
    if state.store.get_order(order_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Order not found: {order_id}")));
    }

    let events = state.store.events_for_aggregate(order_id).await?;
    Ok(Json(events))
}

fn parse_order_id(id: &str) -> Result<AggregateId, ApiError> {
    AggregateId::parse(id).map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))
}
