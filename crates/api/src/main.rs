//! API server entry point.

use std::sync::Arc;
use std::time::Duration;

use api::{AppStore, Config};
use relay::LoggingEventBus;
use saga::{
    InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
    LocalWorkflowEngine, SagaOrchestrator,
};
use sqlx::postgres::PgPoolOptions;
use store::{InMemoryStore, PostgresStore};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(config.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Open the store and serve
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(&url)
                .await
                .expect("failed to connect to database");
            let store = PostgresStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL store");
            run(store, config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store; data is lost on exit");
            run(InMemoryStore::new(), config, metrics_handle).await;
        }
    }
}

async fn run<S: AppStore>(
    store: S,
    config: Config,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
) {
    // Business capabilities are in-process fakes until real services exist.
    let orchestrator = SagaOrchestrator::new(
        store.clone(),
        InMemoryInventoryService::new(),
        InMemoryPaymentService::new(),
        InMemoryNotificationService::new(),
        config.saga_config(),
    );
    let engine = Arc::new(LocalWorkflowEngine::new(orchestrator));
    let state = api::create_state(store, engine, Arc::new(LoggingEventBus), &config);

    // 4. Start the outbox relay and idempotency purge tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = state.relay.clone();
    let relay_task = tokio::spawn(async move { relay.run(shutdown_rx).await });

    let purge_state = state.clone();
    let mut purge_shutdown = shutdown_tx.subscribe();
    let purge_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match purge_state.idempotency.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => {
                            tracing::info!(purged, "expired idempotency records purged");
                            metrics::counter!("idempotency_records_purged_total").increment(purged);
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to purge idempotency records"),
                    }
                }
                _ = purge_shutdown.changed() => break,
            }
        }
    });

    // 5. Start server
    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 6. Stop background tasks
    let _ = shutdown_tx.send(true);
    match relay_task.await {
        Ok(checkpoint) => tracing::info!(%checkpoint, "outbox relay drained"),
        Err(e) => tracing::error!(error = %e, "outbox relay task failed"),
    }
    let _ = purge_task.await;

    tracing::info!("server shut down gracefully");
}
