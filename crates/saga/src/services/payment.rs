//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common::AggregateId;
use domain::{CustomerId, Money};

use crate::error::SagaError;

/// Result of a successful payment charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    /// The payment ID assigned by the payment service.
    pub payment_id: String,
    pub amount: Money,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges a customer for an order.
    async fn charge(
        &self,
        order_id: AggregateId,
        customer_id: &CustomerId,
        amount: Money,
    ) -> Result<PaymentReceipt, SagaError>;

    /// Refunds a previously made payment in full.
    async fn refund(&self, payment_id: &str, amount: Money) -> Result<(), SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, (AggregateId, CustomerId, Money)>,
    refunds: Vec<(String, Money)>,
    next_id: u32,
    fail_on_charge: bool,
    fail_on_refund: bool,
}

/// In-memory payment service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<Mutex<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryPaymentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the service to decline every charge.
    pub fn set_fail_on_charge(&self, fail: bool) {
        self.lock().fail_on_charge = fail;
    }

    /// Configures the service to fail every refund.
    pub fn set_fail_on_refund(&self, fail: bool) {
        self.lock().fail_on_refund = fail;
    }

    /// Returns the number of active payments.
    pub fn payment_count(&self) -> usize {
        self.lock().payments.len()
    }

    /// Returns true if a payment exists with the given ID.
    pub fn has_payment(&self, payment_id: &str) -> bool {
        self.lock().payments.contains_key(payment_id)
    }

    /// Returns every successful refund as `(payment_id, amount)`.
    pub fn refunds(&self) -> Vec<(String, Money)> {
        self.lock().refunds.clone()
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(
        &self,
        order_id: AggregateId,
        customer_id: &CustomerId,
        amount: Money,
    ) -> Result<PaymentReceipt, SagaError> {
        let mut state = self.lock();

        if state.fail_on_charge {
            return Err(SagaError::capability("payment", "Payment declined"));
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state
            .payments
            .insert(payment_id.clone(), (order_id, customer_id.clone(), amount));

        Ok(PaymentReceipt { payment_id, amount })
    }

    async fn refund(&self, payment_id: &str, amount: Money) -> Result<(), SagaError> {
        let mut state = self.lock();

        if state.fail_on_refund {
            return Err(SagaError::capability(
                "payment",
                format!("refund of {payment_id} rejected"),
            ));
        }

        state.payments.remove(payment_id);
        state.refunds.push((payment_id.to_string(), amount));
        Ok(())
    }
}
