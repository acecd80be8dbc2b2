//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use api::{AppState, Config};
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use relay::{InMemoryEventBus, InMemoryWorkflowEngine};
use store::{FeedPosition, InMemoryStore};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestHarness {
    app: axum::Router,
    state: Arc<AppState<InMemoryStore>>,
    engine: InMemoryWorkflowEngine,
    bus: InMemoryEventBus,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let engine = InMemoryWorkflowEngine::new();
        let bus = InMemoryEventBus::new();
        let state = api::create_state(
            InMemoryStore::new(),
            Arc::new(engine.clone()),
            Arc::new(bus.clone()),
            &config,
        );
        let app = api::create_app(state.clone(), get_metrics_handle());
        Self {
            app,
            state,
            engine,
            bus,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post_order(&self, key: Option<&str>, body: serde_json::Value) -> Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/orders")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("x-idempotency-key", key);
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }
}

fn order_body(customer: &str) -> serde_json::Value {
    serde_json::json!({
        "customer_id": customer,
        "items": [
            { "product_id": "SKU-001", "quantity": 2, "price_cents": 1250 },
            { "product_id": "SKU-002", "quantity": 1, "price_cents": 500 }
        ]
    })
}

async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let harness = TestHarness::new();

    let response = harness.get("/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_create_order() {
    let harness = TestHarness::new();

    let response = harness.post_order(None, order_body("cust-1")).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().get("x-idempotent-replayed").is_none());
    let json = body_json(response).await;
    assert_eq!(json["status"], "PENDING");
    assert_eq!(json["total_amount"], 3000);
    assert_eq!(json["message"], "Order created successfully");
    assert!(json["order_id"].is_string());
}

#[tokio::test]
async fn test_create_order_validation_error() {
    let harness = TestHarness::new();

    let response = harness
        .post_order(None, serde_json::json!({ "customer_id": "cust-1", "items": [] }))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"].is_string());
    assert_eq!(harness.state.store.order_count().await, 0);
}

#[tokio::test]
async fn test_idempotent_retry_replays_response() {
    let harness = TestHarness::new();

    let first = harness.post_order(Some("key-1"), order_body("cust-1")).await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first = body_json(first).await;

    let second = harness.post_order(Some("key-1"), order_body("cust-1")).await;
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(
        second.headers().get("x-idempotent-replayed").unwrap(),
        "true"
    );
    let second = body_json(second).await;

    assert_eq!(first["order_id"], second["order_id"]);
    assert_eq!(harness.state.store.order_count().await, 1);
    assert_eq!(harness.state.store.event_count().await, 1);
}

#[tokio::test]
async fn test_reused_key_with_different_payload() {
    let harness = TestHarness::new();

    let first = harness.post_order(Some("key-1"), order_body("cust-1")).await;
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = harness.post_order(Some("key-1"), order_body("cust-2")).await;

    assert_eq!(second.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(harness.state.store.order_count().await, 1);
}

#[tokio::test]
async fn test_failed_request_releases_key() {
    let harness = TestHarness::new();

    let rejected = harness
        .post_order(Some("key-1"), serde_json::json!({ "items": [] }))
        .await;
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

    let accepted = harness.post_order(Some("key-1"), order_body("cust-1")).await;

    assert_eq!(accepted.status(), StatusCode::CREATED);
    assert!(accepted.headers().get("x-idempotent-replayed").is_none());
}

#[tokio::test]
async fn test_get_order() {
    let harness = TestHarness::new();
    let created = body_json(harness.post_order(None, order_body("cust-1")).await).await;
    let order_id = created["order_id"].as_str().unwrap();

    let response = harness.get(&format!("/orders/{order_id}")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["order_id"], order_id);
    assert_eq!(json["customer_id"], "cust-1");
    assert_eq!(json["status"], "PENDING");
    assert_eq!(json["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_get_order_not_found() {
    let harness = TestHarness::new();

    let response = harness
        .get("/orders/00000000-0000-0000-0000-000000000000")
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_order_invalid_id() {
    let harness = TestHarness::new();

    let response = harness.get("/orders/not-a-uuid").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_order_events() {
    let harness = TestHarness::new();
    let created = body_json(harness.post_order(None, order_body("cust-1")).await).await;
    let order_id = created["order_id"].as_str().unwrap();

    let response = harness.get(&format!("/orders/{order_id}/events")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let events = json.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "ORDER_CREATED");
    assert_eq!(events[0]["processed"], false);
    assert_eq!(events[0]["payload"]["total_amount"], 3000);
}

#[tokio::test]
async fn test_relay_dispatches_created_order() {
    let harness = TestHarness::new();
    harness.post_order(None, order_body("cust-1")).await;

    let report = harness
        .state
        .relay
        .poll_once(FeedPosition::initial())
        .await
        .unwrap();

    assert_eq!(report.dispatched(), 1);
    assert_eq!(harness.engine.executions().len(), 1);
    assert!(harness.bus.published().is_empty());
}

#[tokio::test]
async fn test_surfaced_event_is_listed_and_redriven() {
    let harness = TestHarness::with_config(Config {
        relay_max_attempts: 2,
        ..Config::default()
    });
    harness.engine.set_fail_on_start(true);
    harness.post_order(None, order_body("cust-1")).await;

    for _ in 0..2 {
        harness
            .state
            .relay
            .poll_once(FeedPosition::initial())
            .await
            .unwrap();
    }

    let response = harness.get("/outbox/failed").await;
    assert_eq!(response.status(), StatusCode::OK);
    let failed = body_json(response).await;
    let failed = failed.as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["attempts"], 2);
    let event_id = failed[0]["event"]["event_id"].as_str().unwrap().to_string();

    harness.engine.set_fail_on_start(false);
    let response = harness
        .send(
            Request::builder()
                .method("POST")
                .uri(format!("/outbox/failed/{event_id}/redrive"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let outcome = body_json(response).await;
    assert_eq!(outcome["outcome"], "dispatched");
    assert_eq!(outcome["target"], "workflow");
    assert_eq!(harness.engine.executions().len(), 1);

    let remaining = body_json(harness.get("/outbox/failed").await).await;
    assert!(remaining.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_redrive_unknown_event() {
    let harness = TestHarness::new();

    let response = harness
        .send(
            Request::builder()
                .method("POST")
                .uri("/outbox/failed/00000000-0000-0000-0000-000000000000/redrive")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let harness = TestHarness::new();
    harness.post_order(Some("key-m"), order_body("cust-1")).await;
    harness.post_order(Some("key-m"), order_body("cust-1")).await;

    let response = harness.get("/metrics").await;

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("idempotency_replays_total"));
}
