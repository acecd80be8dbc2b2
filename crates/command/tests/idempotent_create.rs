//! Integration tests for order creation behind the idempotency layer.

use command::{
    CommandError, CreateOrderResponse, IdempotencyConfig, IdempotencyError, IdempotencyLayer,
    OrderCommandHandler,
};
use domain::{CreateOrder, CreateOrderItem};
use store::{IdempotencyStatus, InMemoryStore, OutboxStore};

struct TestHarness {
    store: InMemoryStore,
    handler: OrderCommandHandler<InMemoryStore>,
    layer: IdempotencyLayer<InMemoryStore>,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(IdempotencyConfig::default())
    }

    fn with_config(config: IdempotencyConfig) -> Self {
        let store = InMemoryStore::new();
        Self {
            handler: OrderCommandHandler::new(store.clone()),
            layer: IdempotencyLayer::new(store.clone(), config),
            store,
        }
    }

    async fn create(
        &self,
        key: Option<&str>,
        cmd: &CreateOrder,
    ) -> Result<(CreateOrderResponse, bool), IdempotencyError<CommandError>> {
        let result = self
            .layer
            .execute(key, cmd, || self.handler.create_order(cmd.clone()))
            .await?;
        Ok((result.response, result.replayed))
    }
}

fn command() -> CreateOrder {
    CreateOrder::new("cust-1", vec![CreateOrderItem::new("SKU-001", 1, 2500)])
}

#[tokio::test]
async fn same_key_twice_creates_one_order() {
    let harness = TestHarness::new();
    let cmd = command();

    let (first, first_replayed) = harness.create(Some("order-key-1"), &cmd).await.unwrap();
    let (second, second_replayed) = harness.create(Some("order-key-1"), &cmd).await.unwrap();

    assert!(!first_replayed);
    assert!(second_replayed);
    assert_eq!(first, second);
    assert_eq!(harness.store.order_count().await, 1);

    let events = harness.store.events_for_aggregate(first.order_id).await.unwrap();
    assert_eq!(events.len(), 1);

    let record = harness.store.idempotency_record("order-key-1").await.unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
}

#[tokio::test]
async fn different_keys_create_different_orders() {
    let harness = TestHarness::new();
    let cmd = command();

    let (a, _) = harness.create(Some("key-a"), &cmd).await.unwrap();
    let (b, _) = harness.create(Some("key-b"), &cmd).await.unwrap();

    assert_ne!(a.order_id, b.order_id);
    assert_eq!(harness.store.order_count().await, 2);
}

#[tokio::test]
async fn expired_key_creates_a_new_order() {
    let harness = TestHarness::with_config(IdempotencyConfig {
        expires_after: chrono::Duration::milliseconds(20),
        ..IdempotencyConfig::default()
    });
    let cmd = command();

    let (first, _) = harness.create(Some("order-key-1"), &cmd).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    let (second, second_replayed) = harness.create(Some("order-key-1"), &cmd).await.unwrap();

    assert!(!second_replayed);
    assert_ne!(first.order_id, second.order_id);
    assert_eq!(harness.store.order_count().await, 2);
    assert_eq!(harness.store.event_count().await, 2);

    let record = harness.store.idempotency_record("order-key-1").await.unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
    assert_eq!(
        record.response.unwrap()["order_id"],
        serde_json::json!(second.order_id.to_string())
    );
}

#[tokio::test]
async fn validation_failure_is_not_cached() {
    let harness = TestHarness::new();
    let invalid = CreateOrder::new("cust-1", vec![]);

    let err = harness.create(Some("key-v"), &invalid).await.unwrap_err();
    assert!(matches!(
        err,
        IdempotencyError::Handler(CommandError::Validation(_))
    ));
    assert!(harness.store.idempotency_record("key-v").await.is_none());
}

#[tokio::test]
async fn persistence_failure_allows_retry_with_same_key() {
    let harness = TestHarness::new();
    let cmd = command();

    harness.store.set_fail_outbox_insert(true).await;
    let err = harness.create(Some("key-r"), &cmd).await.unwrap_err();
    assert!(matches!(
        err,
        IdempotencyError::Handler(CommandError::Persistence(_))
    ));

    harness.store.set_fail_outbox_insert(false).await;
    let (response, replayed) = harness.create(Some("key-r"), &cmd).await.unwrap();
    assert!(!replayed);
    assert_eq!(harness.store.order_count().await, 1);
    assert_eq!(response.message, "Order created successfully");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_run_handler_once() {
    let harness = std::sync::Arc::new(TestHarness::new());
    let cmd = command();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let harness = harness.clone();
            let cmd = cmd.clone();
            tokio::spawn(async move { harness.create(Some("shared-key"), &cmd).await })
        })
        .collect();

    let mut fresh = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok((_, false)) => fresh += 1,
            Ok((_, true)) => {}
            Err(IdempotencyError::DuplicateInFlight { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(fresh, 1);
    assert_eq!(harness.store.order_count().await, 1);
}
