use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, EventId};
use domain::{Order, OrderStatus, OutboxEvent};
use tokio::sync::RwLock;

use crate::{
    Result, StoreError,
    store::{
        Begin, ChangeKind, FailedEvent, FeedEntry, FeedPosition, IdempotencyRecord,
        IdempotencyStatus, IdempotencyStore, OrderStore, OutboxStore,
    },
};

/// In-memory implementation of all three stores.
///
/// Everything lives behind one lock, so each operation is atomic with
/// respect to every other. Failure points can be switched on to exercise
/// the error paths of callers.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

#[derive(Default)]
struct State {
    orders: HashMap<AggregateId, Order>,
    events: Vec<StoredEvent>,
    feed: Vec<FeedEntry>,
    idempotency: HashMap<String, IdempotencyRecord>,
    fail_outbox_insert: bool,
    fail_status_update: bool,
    failing_status_updates: u32,
    fail_mark_processed: bool,
    suppress_feed: bool,
}

struct StoredEvent {
    event: OutboxEvent,
    attempts: u32,
    last_error: Option<String>,
}

impl State {
    fn append_feed(&mut self, kind: ChangeKind, image: serde_json::Value) {
        if self.suppress_feed {
            return;
        }
        let position = FeedPosition::new(self.feed.len() as i64 + 1);
        self.feed.push(FeedEntry {
            position,
            kind,
            image,
        });
    }

    fn insert_event(&mut self, event: &OutboxEvent) -> Result<()> {
        if self.fail_outbox_insert {
            return Err(StoreError::Injected("outbox insert"));
        }
        if self.events.iter().any(|e| e.event.event_id == event.event_id) {
            return Err(StoreError::Duplicate(event.event_id.to_string()));
        }
        let image = serde_json::to_value(event)?;
        self.events.push(StoredEvent {
            event: event.clone(),
            attempts: 0,
            last_error: None,
        });
        self.append_feed(ChangeKind::Insert, image);
        Ok(())
    }

    fn event_mut(&mut self, event_id: EventId) -> Result<&mut StoredEvent> {
        self.events
            .iter_mut()
            .find(|e| e.event.event_id == event_id)
            .ok_or(StoreError::EventNotFound(event_id))
    }
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every outbox insert fail, which also aborts the enclosing order write.
    pub async fn set_fail_outbox_insert(&self, fail: bool) {
        self.state.write().await.fail_outbox_insert = fail;
    }

    /// Makes every status update fail.
    pub async fn set_fail_status_update(&self, fail: bool) {
        self.state.write().await.fail_status_update = fail;
    }

    /// Makes only the next `count` status updates fail.
    pub async fn set_fail_next_status_updates(&self, count: u32) {
        self.state.write().await.failing_status_updates = count;
    }

    /// Writes changes without feed entries, as if the relay's cursor had
    /// already moved past their positions.
    pub async fn set_suppress_feed(&self, suppress: bool) {
        self.state.write().await.suppress_feed = suppress;
    }

    /// Makes every `mark_processed` call fail.
    pub async fn set_fail_mark_processed(&self, fail: bool) {
        self.state.write().await.fail_mark_processed = fail;
    }

    /// Appends an arbitrary entry to the change feed.
    ///
    /// Used to simulate redelivery and malformed records.
    pub async fn push_feed_entry(&self, kind: ChangeKind, image: serde_json::Value) -> FeedPosition {
        let mut state = self.state.write().await;
        state.append_feed(kind, image);
        FeedPosition::new(state.feed.len() as i64)
    }

    /// Returns the number of orders stored.
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    /// Returns the number of outbox events stored.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.events.len()
    }

    /// Returns the idempotency record for a key, expired or not.
    pub async fn idempotency_record(&self, key: &str) -> Option<IdempotencyRecord> {
        self.state.read().await.idempotency.get(key).cloned()
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn create_order(&self, order: &Order, event: &OutboxEvent) -> Result<()> {
        let mut state = self.state.write().await;

        if state.orders.contains_key(&order.order_id()) {
            return Err(StoreError::Duplicate(order.order_id().to_string()));
        }

        state.orders.insert(order.order_id(), order.clone());
        if let Err(e) = state.insert_event(event) {
            state.orders.remove(&order.order_id());
            return Err(e);
        }

        Ok(())
    }

    async fn get_order(&self, order_id: AggregateId) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(&order_id).cloned())
    }

    async fn update_status_with_event(
        &self,
        order_id: AggregateId,
        status: OrderStatus,
        event: Option<&OutboxEvent>,
    ) -> Result<Order> {
        let mut state = self.state.write().await;

        if state.fail_status_update {
            return Err(StoreError::Injected("status update"));
        }
        if state.failing_status_updates > 0 {
            state.failing_status_updates -= 1;
            return Err(StoreError::Injected("status update"));
        }

        let current = state
            .orders
            .get(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;

        let mut updated = current.clone();
        updated
            .transition_to(status, Utc::now())
            .map_err(|_| StoreError::ConditionFailed {
                order_id,
                current: current.status(),
                to: status,
            })?;

        if let Some(event) = event {
            state.insert_event(event)?;
        }
        state.orders.insert(order_id, updated.clone());

        Ok(updated)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn read_feed(&self, after: FeedPosition, limit: usize) -> Result<Vec<FeedEntry>> {
        let state = self.state.read().await;
        Ok(state
            .feed
            .iter()
            .filter(|entry| entry.position > after)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_event(&self, event_id: EventId) -> Result<Option<OutboxEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .find(|e| e.event.event_id == event_id)
            .map(|e| e.event.clone()))
    }

    async fn events_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<OutboxEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.event.aggregate_id == aggregate_id)
            .map(|e| e.event.clone())
            .collect())
    }

    async fn mark_processed(&self, event_id: EventId) -> Result<bool> {
        let mut state = self.state.write().await;

        if state.fail_mark_processed {
            return Err(StoreError::Injected("mark processed"));
        }

        let stored = state.event_mut(event_id)?;
        if stored.event.processed {
            return Ok(false);
        }
        stored.event.processed = true;
        let image = serde_json::to_value(&stored.event)?;
        state.append_feed(ChangeKind::Modify, image);

        Ok(true)
    }

    async fn record_dispatch_failure(&self, event_id: EventId, error: &str) -> Result<u32> {
        let mut state = self.state.write().await;
        let stored = state.event_mut(event_id)?;
        stored.attempts += 1;
        stored.last_error = Some(error.to_string());
        Ok(stored.attempts)
    }

    async fn failed_events(&self, min_attempts: u32) -> Result<Vec<FailedEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| !e.event.processed && e.attempts > 0 && e.attempts >= min_attempts)
            .map(|e| FailedEvent {
                event: e.event.clone(),
                attempts: e.attempts,
                last_error: e.last_error.clone(),
            })
            .collect())
    }

    async fn unprocessed_events(
        &self,
        created_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| {
                !e.event.processed
                    && e.event.created_at < created_before
                    && e.attempts < max_attempts
            })
            .take(limit)
            .map(|e| e.event.clone())
            .collect())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn try_begin(
        &self,
        key: &str,
        fingerprint: &str,
        claim: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Begin> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.idempotency.get(key)
            && !existing.is_expired(now)
        {
            return Ok(Begin::Existing(existing.clone()));
        }

        state.idempotency.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                status: IdempotencyStatus::InProgress,
                fingerprint: fingerprint.to_string(),
                claim: claim.to_string(),
                response: None,
                expires_at,
            },
        );
        Ok(Begin::Started)
    }

    async fn complete(
        &self,
        key: &str,
        claim: &str,
        response: &serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.idempotency.get_mut(key) {
            Some(record) if record.claim == claim => {
                record.status = IdempotencyStatus::Completed;
                record.response = Some(response.clone());
                record.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, claim: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        if state
            .idempotency
            .get(key)
            .is_some_and(|record| record.claim == claim)
        {
            state.idempotency.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, record| !record.is_expired(now));
        Ok((before - state.idempotency.len()) as u64)
    }
}
