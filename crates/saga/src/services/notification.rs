//! Notification service trait and in-memory implementation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::AggregateId;
use domain::CustomerId;

use crate::error::SagaError;

/// Result of a delivered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationReceipt {
    pub notification_id: String,
}

/// Trait for customer notifications.
#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Sends the order confirmation to the customer.
    async fn send(
        &self,
        order_id: AggregateId,
        customer_id: &CustomerId,
        payment_id: Option<&str>,
    ) -> Result<NotificationReceipt, SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryNotificationState {
    sent: Vec<(AggregateId, CustomerId)>,
    fail_on_send: bool,
    send_delay: Option<Duration>,
}

/// In-memory notification service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    state: Arc<Mutex<InMemoryNotificationState>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryNotificationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the service to fail every send.
    pub fn set_fail_on_send(&self, fail: bool) {
        self.lock().fail_on_send = fail;
    }

    /// Delays every send call before anything is delivered.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.lock().send_delay = delay;
    }

    /// Returns the number of notifications delivered.
    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn send(
        &self,
        order_id: AggregateId,
        customer_id: &CustomerId,
        _payment_id: Option<&str>,
    ) -> Result<NotificationReceipt, SagaError> {
        let delay = self.lock().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.fail_on_send {
            return Err(SagaError::capability("notification", "Mail server unavailable"));
        }

        state.sent.push((order_id, customer_id.clone()));
        Ok(NotificationReceipt {
            notification_id: format!("NTF-{:04}", state.sent.len()),
        })
    }
}
