//! Saga orchestrator driving the steps of one order.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::AggregateId;
use domain::{CustomerId, OrderStatus};
use serde::Serialize;
use store::OrderStore;

use crate::context::{NotificationStatus, SagaContext};
use crate::error::{Result, SagaError};
use crate::services::{
    InventoryService, NotificationReceipt, NotificationService, PaymentService,
};
use crate::steps::{self, CompensationReport, SagaStep, StepResult};

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// A step still running after this long is treated as failed.
    pub step_timeout: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

/// Final state of one saga execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SagaOutcome {
    pub order_id: AggregateId,
    pub status: OrderStatus,
    /// Steps in the order they ran, compensation included.
    pub steps: Vec<SagaStep>,
    pub context: SagaContext,
    /// The error that triggered compensation.
    pub failure: Option<String>,
    pub compensation: Option<CompensationReport>,
}

impl SagaOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == OrderStatus::Completed
    }

    pub fn notification(&self) -> Option<&NotificationStatus> {
        self.context.notification.as_ref()
    }
}

/// Runs the order fulfillment saga: reserve inventory, process payment,
/// send notification, with compensation on failure.
///
/// Steps run one at a time. Each is bounded by the step timeout, and the
/// next step is chosen from [`SagaStep::next`].
pub struct SagaOrchestrator<S, I, P, N>
where
    S: OrderStore,
    I: InventoryService,
    P: PaymentService,
    N: NotificationService,
{
    store: S,
    inventory: I,
    payment: P,
    notification: N,
    config: SagaConfig,
}

impl<S, I, P, N> SagaOrchestrator<S, I, P, N>
where
    S: OrderStore,
    I: InventoryService,
    P: PaymentService,
    N: NotificationService,
{
    /// Creates a new saga orchestrator.
    pub fn new(store: S, inventory: I, payment: P, notification: N, config: SagaConfig) -> Self {
        Self {
            store,
            inventory,
            payment,
            notification,
            config,
        }
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Executes the saga for the order described by `context`.
    ///
    /// Step failures are handled by compensation and reported in the
    /// outcome; an `Err` means the final status could not be written.
    #[tracing::instrument(skip(self, context), fields(order_id = %context.order_id))]
    pub async fn run(&self, context: SagaContext) -> Result<SagaOutcome> {
        metrics::counter!("saga_executions_total").increment(1);
        let saga_start = Instant::now();
        let order_id = context.order_id;

        let mut context = context;
        let mut executed = Vec::new();
        let mut step = SagaStep::FIRST;

        let failure = loop {
            tracing::info!(%order_id, %step, "saga step started");
            executed.push(step);

            match self.run_step(step, context.clone()).await {
                StepResult::Succeeded(next) => {
                    context = next;
                    match step.next(true) {
                        Some(next_step) => step = next_step,
                        None => break None,
                    }
                }
                StepResult::Failed {
                    context: failed,
                    error,
                } => {
                    tracing::warn!(%order_id, %step, error = %error, "saga step failed");
                    context = failed;
                    break Some(error);
                }
            }
        };

        let Some(error) = failure else {
            let duration = saga_start.elapsed().as_secs_f64();
            metrics::histogram!("saga_duration_seconds").record(duration);
            metrics::counter!("saga_completed").increment(1);
            tracing::info!(%order_id, duration, "saga completed successfully");
            return Ok(SagaOutcome {
                order_id,
                status: OrderStatus::Completed,
                steps: executed,
                context,
                failure: None,
                compensation: None,
            });
        };

        executed.push(SagaStep::Compensate);
        let reason = error.to_string();
        let report = steps::compensate(
            &self.store,
            &self.inventory,
            &self.payment,
            order_id,
            context.compensation.clone(),
            &reason,
        )
        .await?;
        context.compensation.clear();

        metrics::histogram!("saga_duration_seconds").record(saga_start.elapsed().as_secs_f64());
        metrics::counter!("saga_failed").increment(1);
        tracing::warn!(
            %order_id,
            reason = %reason,
            compensations = ?report.applied(),
            "saga failed"
        );

        Ok(SagaOutcome {
            order_id,
            status: report.status,
            steps: executed,
            context,
            failure: Some(reason),
            compensation: Some(report),
        })
    }

    /// Runs one forward step under the step timeout.
    ///
    /// On timeout the pre-step context is returned, so only effects that
    /// earlier steps reported are compensated. The notification step bounds
    /// only its capability call: a slow notification is a failed
    /// notification, and the order still completes.
    async fn run_step(&self, step: SagaStep, context: SagaContext) -> StepResult {
        if step == SagaStep::SendNotification {
            let notification = BoundedNotification {
                inner: &self.notification,
                timeout: self.config.step_timeout,
            };
            return steps::send_notification(&self.store, &notification, context).await;
        }

        let fallback = context.clone();
        let fut = async {
            match step {
                SagaStep::ReserveInventory => {
                    steps::reserve_inventory(&self.store, &self.inventory, context).await
                }
                SagaStep::ProcessPayment => {
                    steps::process_payment(&self.store, &self.payment, context).await
                }
                SagaStep::SendNotification | SagaStep::Compensate => StepResult::Failed {
                    context,
                    error: SagaError::Aborted(format!("{step} is not run under a step timeout")),
                },
            }
        };

        match tokio::time::timeout(self.config.step_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!("saga_step_timeouts_total").increment(1);
                StepResult::Failed {
                    context: fallback,
                    error: SagaError::Timeout {
                        step: step.to_string(),
                        after: self.config.step_timeout,
                    },
                }
            }
        }
    }
}

/// A notification service whose calls fail with a timeout after `timeout`.
struct BoundedNotification<'a, N: ?Sized> {
    inner: &'a N,
    timeout: Duration,
}

#[async_trait]
impl<N> NotificationService for BoundedNotification<'_, N>
where
    N: NotificationService + ?Sized,
{
    async fn send(
        &self,
        order_id: AggregateId,
        customer_id: &CustomerId,
        payment_id: Option<&str>,
    ) -> std::result::Result<NotificationReceipt, SagaError> {
        let sent = self.inner.send(order_id, customer_id, payment_id);
        match tokio::time::timeout(self.timeout, sent).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!("saga_step_timeouts_total").increment(1);
                Err(SagaError::Timeout {
                    step: SagaStep::SendNotification.to_string(),
                    after: self.timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use domain::{CustomerId, EventType, Money, Order, OrderItem, OutboxEvent, SagaFailedPayload};
    use store::{InMemoryStore, OutboxStore};

    use super::*;
    use crate::compensation::CompensationOutcome;
    use crate::services::{
        InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
    };

    type TestOrchestrator = SagaOrchestrator<
        InMemoryStore,
        InMemoryInventoryService,
        InMemoryPaymentService,
        InMemoryNotificationService,
    >;

    struct Fixture {
        store: InMemoryStore,
        inventory: InMemoryInventoryService,
        payment: InMemoryPaymentService,
        notification: InMemoryNotificationService,
        orchestrator: TestOrchestrator,
    }

    fn fixture(config: SagaConfig) -> Fixture {
        let store = InMemoryStore::new();
        let inventory = InMemoryInventoryService::new();
        let payment = InMemoryPaymentService::new();
        let notification = InMemoryNotificationService::new();
        let orchestrator = SagaOrchestrator::new(
            store.clone(),
            inventory.clone(),
            payment.clone(),
            notification.clone(),
            config,
        );
        Fixture {
            store,
            inventory,
            payment,
            notification,
            orchestrator,
        }
    }

    async fn create_order(store: &InMemoryStore) -> SagaContext {
        let order = Order::new(
            AggregateId::new(),
            CustomerId::from("cust-1"),
            vec![
                OrderItem::new("SKU-001", 2, Money::from_cents(1500)),
                OrderItem::new("SKU-002", 1, Money::from_cents(250)),
            ],
            Utc::now(),
        )
        .unwrap();
        let event = OutboxEvent::order_created(&order).unwrap();
        store.create_order(&order, &event).await.unwrap();
        SagaContext::from_input(event.payload).unwrap()
    }

    async fn stored_status(store: &InMemoryStore, order_id: AggregateId) -> OrderStatus {
        store.get_order(order_id).await.unwrap().unwrap().status()
    }

    #[tokio::test]
    async fn happy_path_completes_order() {
        let f = fixture(SagaConfig::default());
        let context = create_order(&f.store).await;
        let order_id = context.order_id;

        let outcome = f.orchestrator.run(context).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(
            outcome.steps,
            vec![
                SagaStep::ReserveInventory,
                SagaStep::ProcessPayment,
                SagaStep::SendNotification
            ]
        );
        assert!(outcome.context.compensation.is_empty());
        assert!(matches!(
            outcome.notification(),
            Some(NotificationStatus::Sent { .. })
        ));
        assert_eq!(stored_status(&f.store, order_id).await, OrderStatus::Completed);
        assert_eq!(f.inventory.reservation_count(), 1);
        assert_eq!(f.payment.payment_count(), 1);
        assert_eq!(f.notification.sent_count(), 1);
        assert_eq!(
            f.payment.refunds().len(),
            0,
            "a completed saga refunds nothing"
        );

        let types: Vec<_> = f
            .store
            .events_for_aggregate(order_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                EventType::OrderCreated,
                EventType::InventoryReserved,
                EventType::PaymentProcessed,
                EventType::NotificationSent
            ]
        );
    }

    #[tokio::test]
    async fn payment_failure_releases_inventory_once() {
        let f = fixture(SagaConfig::default());
        f.payment.set_fail_on_charge(true);
        let context = create_order(&f.store).await;
        let order_id = context.order_id;

        let outcome = f.orchestrator.run(context).await.unwrap();

        assert_eq!(outcome.status, OrderStatus::Failed);
        let report = outcome.compensation.unwrap();
        assert_eq!(
            report.outcomes,
            vec![
                CompensationOutcome::Skipped {
                    step: SagaStep::ProcessPayment
                },
                CompensationOutcome::Applied {
                    step: SagaStep::ReserveInventory,
                    description: "Released inventory RES-0001".to_string()
                },
            ]
        );
        assert_eq!(f.inventory.release_calls(), 1);
        assert_eq!(f.inventory.reservation_count(), 0);
        assert_eq!(stored_status(&f.store, order_id).await, OrderStatus::Failed);

        let events = f.store.events_for_aggregate(order_id).await.unwrap();
        let saga_failed = events
            .iter()
            .find(|e| e.event_type == EventType::SagaFailed)
            .unwrap()
            .payload_as::<SagaFailedPayload>()
            .unwrap();
        assert!(saga_failed.reason.contains("Payment declined"));
        assert_eq!(saga_failed.compensations.len(), 2);
    }

    #[tokio::test]
    async fn inventory_failure_skips_compensation() {
        let f = fixture(SagaConfig::default());
        f.inventory.set_fail_on_reserve(true);
        let context = create_order(&f.store).await;
        let order_id = context.order_id;

        let outcome = f.orchestrator.run(context).await.unwrap();

        assert_eq!(outcome.status, OrderStatus::Failed);
        assert!(outcome.compensation.unwrap().outcomes.is_empty());
        assert_eq!(f.inventory.release_calls(), 0);
        assert_eq!(f.payment.payment_count(), 0);

        let types: Vec<_> = f
            .store
            .events_for_aggregate(order_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![EventType::OrderCreated, EventType::InventoryReservationFailed]
        );
    }

    #[tokio::test]
    async fn notification_failure_still_completes() {
        let f = fixture(SagaConfig::default());
        f.notification.set_fail_on_send(true);
        let context = create_order(&f.store).await;

        let outcome = f.orchestrator.run(context).await.unwrap();

        assert!(outcome.is_completed());
        assert!(outcome.compensation.is_none());
        assert!(matches!(
            outcome.notification(),
            Some(NotificationStatus::Failed { .. })
        ));
        assert_eq!(f.inventory.release_calls(), 0);
        assert!(f.payment.refunds().is_empty());
    }

    #[tokio::test]
    async fn failing_compensation_still_fails_order() {
        let f = fixture(SagaConfig::default());
        f.payment.set_fail_on_charge(true);
        f.inventory.set_fail_on_release(true);
        let context = create_order(&f.store).await;
        let order_id = context.order_id;

        let outcome = f.orchestrator.run(context).await.unwrap();

        let report = outcome.compensation.unwrap();
        assert!(report.has_failures());
        assert_eq!(stored_status(&f.store, order_id).await, OrderStatus::Failed);
        assert_eq!(f.inventory.reservation_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_step_compensates_recorded_effects_only() {
        let f = fixture(SagaConfig {
            step_timeout: Duration::from_millis(50),
        });
        f.inventory.set_reserve_delay(Some(Duration::from_secs(5)));
        let context = create_order(&f.store).await;
        let order_id = context.order_id;

        let outcome = f.orchestrator.run(context).await.unwrap();

        assert_eq!(outcome.status, OrderStatus::Failed);
        assert!(
            outcome
                .failure
                .as_deref()
                .is_some_and(|msg| msg.contains("timed out"))
        );
        assert!(outcome.compensation.unwrap().outcomes.is_empty());
        // The reservation made by the timed-out call was never reported.
        assert_eq!(f.inventory.release_calls(), 0);
        assert_eq!(stored_status(&f.store, order_id).await, OrderStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_notification_completes_without_compensation() {
        let f = fixture(SagaConfig {
            step_timeout: Duration::from_millis(50),
        });
        f.notification.set_send_delay(Some(Duration::from_secs(60)));
        let context = create_order(&f.store).await;
        let order_id = context.order_id;

        let outcome = f.orchestrator.run(context).await.unwrap();

        assert!(outcome.is_completed());
        assert!(outcome.compensation.is_none());
        assert_eq!(
            outcome.steps,
            vec![
                SagaStep::ReserveInventory,
                SagaStep::ProcessPayment,
                SagaStep::SendNotification
            ]
        );
        assert!(matches!(
            outcome.notification(),
            Some(NotificationStatus::Failed { reason }) if reason.contains("timed out")
        ));
        assert_eq!(stored_status(&f.store, order_id).await, OrderStatus::Completed);
        assert!(f.payment.refunds().is_empty());
        assert_eq!(f.inventory.release_calls(), 0);
        assert_eq!(f.inventory.reservation_count(), 1);
        assert_eq!(
            f.store
                .events_for_aggregate(order_id)
                .await
                .unwrap()
                .last()
                .map(|e| e.event_type),
            Some(EventType::NotificationFailed)
        );
    }
}
