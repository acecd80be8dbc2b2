//! Saga steps and their transition table.
//!
//! Each step takes the saga context and one capability, performs the
//! capability call, writes the resulting order status together with its
//! outbox event, and hands the updated context back to the driver.

use std::time::Duration;

use chrono::Utc;
use common::AggregateId;
use domain::{
    EventType, InventoryReservedPayload, NotificationPayload, OrderStatus, OutboxEvent,
    PaymentProcessedPayload, SagaFailedPayload, StepFailedPayload,
};
use serde::{Deserialize, Serialize};
use store::{OrderStore, OrderStoreExt};

use crate::compensation::{
    CompensationAction, CompensationEntry, CompensationOutcome, CompensationStack,
};
use crate::context::{NotificationStatus, SagaContext};
use crate::error::{Result, SagaError};
use crate::services::{InventoryService, NotificationService, PaymentService};

/// The steps of the order fulfillment saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStep {
    ReserveInventory,
    ProcessPayment,
    SendNotification,
    Compensate,
}

impl SagaStep {
    /// The step every execution starts with.
    pub const FIRST: SagaStep = SagaStep::ReserveInventory;

    /// Forward steps that hold something to undo, in compensation order.
    pub const COMPENSABLE_REVERSE: [SagaStep; 2] =
        [SagaStep::ProcessPayment, SagaStep::ReserveInventory];

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::ReserveInventory => "RESERVE_INVENTORY",
            SagaStep::ProcessPayment => "PROCESS_PAYMENT",
            SagaStep::SendNotification => "SEND_NOTIFICATION",
            SagaStep::Compensate => "COMPENSATE",
        }
    }

    /// The transition table. `None` ends the execution.
    ///
    /// `SendNotification` fails only when the `COMPLETED` write fails; a
    /// failed or slow notification is reported as a success.
    pub fn next(&self, succeeded: bool) -> Option<SagaStep> {
        match (self, succeeded) {
            (SagaStep::ReserveInventory, true) => Some(SagaStep::ProcessPayment),
            (SagaStep::ProcessPayment, true) => Some(SagaStep::SendNotification),
            (SagaStep::SendNotification, true) => None,
            (SagaStep::Compensate, _) => None,
            (_, false) => Some(SagaStep::Compensate),
        }
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a forward step hands back to the driver.
#[derive(Debug)]
pub enum StepResult {
    Succeeded(SagaContext),
    /// The context includes every effect acquired before the failure.
    Failed {
        context: SagaContext,
        error: SagaError,
    },
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Succeeded(_))
    }

    pub fn context(&self) -> &SagaContext {
        match self {
            StepResult::Succeeded(context) | StepResult::Failed { context, .. } => context,
        }
    }
}

/// Outcome of the compensation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationReport {
    pub order_id: AggregateId,
    /// One outcome per compensable step, in execution order. Empty when
    /// nothing had been acquired.
    pub outcomes: Vec<CompensationOutcome>,
    pub status: OrderStatus,
}

impl CompensationReport {
    /// Descriptions of the actions that were applied.
    pub fn applied(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                CompensationOutcome::Applied { description, .. } => Some(description.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o, CompensationOutcome::Failed { .. }))
    }
}

fn outbox_event<P: Serialize>(
    order_id: AggregateId,
    event_type: EventType,
    payload: &P,
) -> Result<OutboxEvent> {
    Ok(OutboxEvent::new(order_id, event_type, payload)?)
}

fn step_failed_event(order_id: AggregateId, step: SagaStep, error: &SagaError) -> Result<OutboxEvent> {
    let event_type = match step {
        SagaStep::ReserveInventory => EventType::InventoryReservationFailed,
        _ => EventType::PaymentFailed,
    };
    outbox_event(
        order_id,
        event_type,
        &StepFailedPayload {
            order_id,
            step: step.to_string(),
            reason: error.to_string(),
            timestamp: Utc::now(),
        },
    )
}

/// Reserves stock and moves the order to `INVENTORY_RESERVED`.
///
/// A declined reservation has nothing to undo, so the order goes straight
/// to `FAILED` with an `INVENTORY_RESERVATION_FAILED` event.
#[tracing::instrument(skip_all, fields(order_id = %context.order_id))]
pub async fn reserve_inventory<S, I>(store: &S, inventory: &I, mut context: SagaContext) -> StepResult
where
    S: OrderStore,
    I: InventoryService + ?Sized,
{
    let order_id = context.order_id;

    let reservation = match inventory.reserve(order_id, &context.items).await {
        Ok(reservation) => reservation,
        Err(error) => {
            tracing::warn!(%order_id, error = %error, "inventory reservation failed");
            let written = async {
                let event = step_failed_event(order_id, SagaStep::ReserveInventory, &error)?;
                store
                    .update_status_with_event(order_id, OrderStatus::Failed, Some(&event))
                    .await?;
                Ok::<_, SagaError>(())
            }
            .await;
            if let Err(e) = written {
                tracing::error!(%order_id, error = %e, "failed to record reservation failure");
            }
            return StepResult::Failed { context, error };
        }
    };

    let reservation_id = reservation.reservation_id;
    context.reservation_id = Some(reservation_id.clone());
    context.compensation.push(CompensationEntry::new(
        SagaStep::ReserveInventory,
        CompensationAction::ReleaseReservation {
            reservation_id: reservation_id.clone(),
        },
    ));

    let written = async {
        let event = outbox_event(
            order_id,
            EventType::InventoryReserved,
            &InventoryReservedPayload {
                order_id,
                reservation_id: reservation_id.clone(),
                timestamp: Utc::now(),
            },
        )?;
        store
            .update_status_with_event(order_id, OrderStatus::InventoryReserved, Some(&event))
            .await?;
        Ok::<_, SagaError>(())
    }
    .await;

    match written {
        Ok(()) => {
            tracing::info!(%order_id, reservation_id = %reservation_id, "inventory reserved");
            StepResult::Succeeded(context)
        }
        Err(error) => StepResult::Failed { context, error },
    }
}

/// Charges the order total and moves the order to `PAYMENT_PROCESSED`.
///
/// A declined charge records `PAYMENT_FAILED` without leaving the current
/// status; compensation then drives the order to `FAILED`.
#[tracing::instrument(skip_all, fields(order_id = %context.order_id))]
pub async fn process_payment<S, P>(store: &S, payment: &P, mut context: SagaContext) -> StepResult
where
    S: OrderStore,
    P: PaymentService + ?Sized,
{
    let order_id = context.order_id;

    let receipt = match payment
        .charge(order_id, &context.customer_id, context.total_amount)
        .await
    {
        Ok(receipt) => receipt,
        Err(error) => {
            tracing::warn!(%order_id, error = %error, "payment failed");
            let written = async {
                let event = step_failed_event(order_id, SagaStep::ProcessPayment, &error)?;
                store
                    .update_status_with_event(order_id, OrderStatus::InventoryReserved, Some(&event))
                    .await?;
                Ok::<_, SagaError>(())
            }
            .await;
            if let Err(e) = written {
                tracing::error!(%order_id, error = %e, "failed to record payment failure");
            }
            return StepResult::Failed { context, error };
        }
    };

    context.payment_id = Some(receipt.payment_id.clone());
    context.compensation.push(CompensationEntry::new(
        SagaStep::ProcessPayment,
        CompensationAction::RefundPayment {
            payment_id: receipt.payment_id.clone(),
            amount: receipt.amount,
        },
    ));

    let written = async {
        let event = outbox_event(
            order_id,
            EventType::PaymentProcessed,
            &PaymentProcessedPayload {
                order_id,
                payment_id: receipt.payment_id.clone(),
                amount: receipt.amount,
                timestamp: Utc::now(),
            },
        )?;
        store
            .update_status_with_event(order_id, OrderStatus::PaymentProcessed, Some(&event))
            .await?;
        Ok::<_, SagaError>(())
    }
    .await;

    match written {
        Ok(()) => {
            tracing::info!(%order_id, payment_id = %receipt.payment_id, amount = %receipt.amount, "payment processed");
            StepResult::Succeeded(context)
        }
        Err(error) => StepResult::Failed { context, error },
    }
}

/// Notifies the customer and completes the order.
///
/// A failed notification is reported in the context but still completes
/// the order. Only a failed status write fails the step.
#[tracing::instrument(skip_all, fields(order_id = %context.order_id))]
pub async fn send_notification<S, N>(
    store: &S,
    notification: &N,
    mut context: SagaContext,
) -> StepResult
where
    S: OrderStore,
    N: NotificationService + ?Sized,
{
    let order_id = context.order_id;

    let sent = notification
        .send(order_id, &context.customer_id, context.payment_id.as_deref())
        .await;

    let (status, event_type, payload) = match sent {
        Ok(receipt) => (
            NotificationStatus::Sent {
                notification_id: receipt.notification_id.clone(),
            },
            EventType::NotificationSent,
            NotificationPayload {
                order_id,
                notification_id: Some(receipt.notification_id),
                error: None,
                timestamp: Utc::now(),
            },
        ),
        Err(error) => {
            tracing::warn!(%order_id, error = %error, "notification failed, completing order anyway");
            metrics::counter!("notification_failures_total").increment(1);
            (
                NotificationStatus::Failed {
                    reason: error.to_string(),
                },
                EventType::NotificationFailed,
                NotificationPayload {
                    order_id,
                    notification_id: None,
                    error: Some(error.to_string()),
                    timestamp: Utc::now(),
                },
            )
        }
    };

    let written = async {
        let event = outbox_event(order_id, event_type, &payload)?;
        store
            .update_status_with_event(order_id, OrderStatus::Completed, Some(&event))
            .await?;
        Ok::<_, SagaError>(())
    }
    .await;

    context.notification = Some(status);
    match written {
        Ok(()) => {
            context.compensation.clear();
            StepResult::Succeeded(context)
        }
        Err(error) => StepResult::Failed { context, error },
    }
}

/// Undoes every effect on the compensation stack and fails the order.
///
/// With an empty stack the order goes straight to `FAILED` (a no-op when a
/// step already wrote it). Otherwise the order passes through
/// `COMPENSATING`, the stack is unwound in reverse order, and the order
/// ends in `FAILED` with a `SAGA_FAILED` event even if an action failed.
#[tracing::instrument(skip_all, fields(order_id = %order_id))]
pub async fn compensate<S, I, P>(
    store: &S,
    inventory: &I,
    payment: &P,
    order_id: AggregateId,
    mut stack: CompensationStack,
    reason: &str,
) -> Result<CompensationReport>
where
    S: OrderStore,
    I: InventoryService + ?Sized,
    P: PaymentService + ?Sized,
{
    if stack.is_empty() {
        let order = store
            .get_order(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))?;
        if order.status() != OrderStatus::Failed {
            write_saga_failed_with_retry(store, order_id, reason, Vec::new()).await?;
        }
        return Ok(CompensationReport {
            order_id,
            outcomes: Vec::new(),
            status: OrderStatus::Failed,
        });
    }

    if let Err(e) = store.update_status(order_id, OrderStatus::Compensating).await {
        tracing::error!(%order_id, error = %e, "failed to mark order compensating");
    }

    let mut outcomes = Vec::with_capacity(SagaStep::COMPENSABLE_REVERSE.len());
    for step in SagaStep::COMPENSABLE_REVERSE {
        let outcome = match stack.pop_for(step) {
            Some(entry) => apply(inventory, payment, order_id, entry).await,
            None => CompensationOutcome::Skipped { step },
        };
        tracing::info!(%order_id, %step, outcome = %outcome.summary(), "compensation step finished");
        outcomes.push(outcome);
    }

    let summaries = outcomes.iter().map(CompensationOutcome::summary).collect();
    write_saga_failed_with_retry(store, order_id, reason, summaries).await?;

    Ok(CompensationReport {
        order_id,
        outcomes,
        status: OrderStatus::Failed,
    })
}

async fn apply<I, P>(
    inventory: &I,
    payment: &P,
    order_id: AggregateId,
    entry: CompensationEntry,
) -> CompensationOutcome
where
    I: InventoryService + ?Sized,
    P: PaymentService + ?Sized,
{
    let result = match &entry.action {
        CompensationAction::ReleaseReservation { reservation_id } => {
            inventory.release(reservation_id).await
        }
        CompensationAction::RefundPayment { payment_id, amount } => {
            payment.refund(payment_id, *amount).await
        }
    };

    match result {
        Ok(()) => CompensationOutcome::Applied {
            step: entry.step,
            description: entry.description,
        },
        Err(e) => {
            let error = SagaError::CompensationFailed {
                step: entry.step.to_string(),
                reason: e.to_string(),
            };
            tracing::error!(%order_id, error = %error, "compensation action failed");
            metrics::counter!("compensation_failures_total").increment(1);
            CompensationOutcome::Failed {
                step: entry.step,
                description: entry.description,
                reason: e.to_string(),
            }
        }
    }
}

/// Pause before the single retry of the final `FAILED` write.
const FAILED_WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Writes `FAILED`, retrying once so a transient store error does not
/// strand the order in `COMPENSATING`.
async fn write_saga_failed_with_retry<S: OrderStore>(
    store: &S,
    order_id: AggregateId,
    reason: &str,
    compensations: Vec<String>,
) -> Result<()> {
    if let Err(e) = write_saga_failed(store, order_id, reason, compensations.clone()).await {
        tracing::warn!(%order_id, error = %e, "failed to mark order failed, retrying once");
        metrics::counter!("saga_failed_write_retries_total").increment(1);
        tokio::time::sleep(FAILED_WRITE_RETRY_DELAY).await;
        return write_saga_failed(store, order_id, reason, compensations).await;
    }
    Ok(())
}

async fn write_saga_failed<S: OrderStore>(
    store: &S,
    order_id: AggregateId,
    reason: &str,
    compensations: Vec<String>,
) -> Result<()> {
    let event = outbox_event(
        order_id,
        EventType::SagaFailed,
        &SagaFailedPayload {
            order_id,
            reason: reason.to_string(),
            compensations,
            timestamp: Utc::now(),
        },
    )?;
    store
        .update_status_with_event(order_id, OrderStatus::Failed, Some(&event))
        .await?;
    Ok(())
}
