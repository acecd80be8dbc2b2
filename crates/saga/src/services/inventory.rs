//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::AggregateId;
use domain::OrderItem;

use crate::error::SagaError;

/// Result of a successful inventory reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// The reservation ID assigned by the inventory service.
    pub reservation_id: String,
}

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for every item of an order.
    async fn reserve(
        &self,
        order_id: AggregateId,
        items: &[OrderItem],
    ) -> Result<Reservation, SagaError>;

    /// Releases a previously made reservation.
    async fn release(&self, reservation_id: &str) -> Result<(), SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<String, (AggregateId, Vec<OrderItem>)>,
    next_id: u32,
    release_calls: usize,
    fail_on_reserve: bool,
    fail_on_release: bool,
    reserve_delay: Option<Duration>,
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<Mutex<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryInventoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the service to fail every reserve call.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.lock().fail_on_reserve = fail;
    }

    /// Configures the service to fail every release call.
    pub fn set_fail_on_release(&self, fail: bool) {
        self.lock().fail_on_release = fail;
    }

    /// Delays every reserve call, after the reservation is made.
    pub fn set_reserve_delay(&self, delay: Option<Duration>) {
        self.lock().reserve_delay = delay;
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        self.lock().reservations.len()
    }

    /// Returns true if a reservation exists with the given ID.
    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        self.lock().reservations.contains_key(reservation_id)
    }

    /// Returns the number of release calls, including failed ones.
    pub fn release_calls(&self) -> usize {
        self.lock().release_calls
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(
        &self,
        order_id: AggregateId,
        items: &[OrderItem],
    ) -> Result<Reservation, SagaError> {
        let (reservation, delay) = {
            let mut state = self.lock();

            if state.fail_on_reserve {
                return Err(SagaError::capability("inventory", "Insufficient stock"));
            }

            state.next_id += 1;
            let reservation_id = format!("RES-{:04}", state.next_id);
            state
                .reservations
                .insert(reservation_id.clone(), (order_id, items.to_vec()));

            (Reservation { reservation_id }, state.reserve_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(reservation)
    }

    async fn release(&self, reservation_id: &str) -> Result<(), SagaError> {
        let mut state = self.lock();
        state.release_calls += 1;

        if state.fail_on_release {
            return Err(SagaError::capability(
                "inventory",
                format!("could not release {reservation_id}"),
            ));
        }

        state.reservations.remove(reservation_id);
        Ok(())
    }
}
