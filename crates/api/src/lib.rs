//! HTTP entry point for the order service.
//!
//! Exposes order creation behind the idempotency layer, order and outbox
//! inspection, and operator redrive of surfaced outbox events, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use command::{IdempotencyLayer, OrderCommandHandler};
use metrics_exporter_prometheus::PrometheusHandle;
use relay::{EventBus, OutboxRelay, WorkflowEngine};
use store::{IdempotencyStore, OrderStore, OutboxStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use error::ApiError;

/// A store backing every capability the API needs.
pub trait AppStore: OrderStore + OutboxStore + IdempotencyStore + Clone + 'static {}

impl<T> AppStore for T where T: OrderStore + OutboxStore + IdempotencyStore + Clone + 'static {}

/// Shared application state accessible from all handlers.
pub struct AppState<S: AppStore> {
    pub store: S,
    pub commands: OrderCommandHandler<S>,
    pub idempotency: IdempotencyLayer<S>,
    pub relay: Arc<OutboxRelay<S>>,
}

/// Builds the application state over `store`, dispatching through the given
/// workflow engine and event bus.
pub fn create_state<S: AppStore>(
    store: S,
    engine: Arc<dyn WorkflowEngine>,
    bus: Arc<dyn EventBus>,
    config: &Config,
) -> Arc<AppState<S>> {
    let relay = OutboxRelay::new(store.clone(), engine, bus, config.relay_config());

    Arc::new(AppState {
        commands: OrderCommandHandler::new(store.clone()),
        idempotency: IdempotencyLayer::new(store.clone(), config.idempotency_config()),
        relay: Arc::new(relay),
        store,
    })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: AppStore>(state: Arc<AppState<S>>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route("/orders/{id}/events", get(routes::orders::events::<S>))
        .route("/outbox/failed", get(routes::outbox::failed::<S>))
        .route(
            "/outbox/failed/{event_id}/redrive",
            post(routes::outbox::redrive::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
