use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, EventId};
use domain::{Order, OrderStatus, OutboxEvent};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Position of an entry in the outbox change feed.
///
/// Positions are strictly increasing; a reader resumes with the last
/// position it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedPosition(i64);

impl FeedPosition {
    /// Position before the first entry.
    pub const fn initial() -> Self {
        Self(0)
    }

    pub const fn new(position: i64) -> Self {
        Self(position)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// The position immediately before this one.
    pub fn previous(&self) -> Self {
        Self(self.0.saturating_sub(1).max(0))
    }
}

impl Default for FeedPosition {
    fn default() -> Self {
        Self::initial()
    }
}

impl std::fmt::Display for FeedPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of change a feed entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Modify => "MODIFY",
            ChangeKind::Remove => "REMOVE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INSERT" => Some(ChangeKind::Insert),
            "MODIFY" => Some(ChangeKind::Modify),
            "REMOVE" => Some(ChangeKind::Remove),
            _ => None,
        }
    }
}

/// One change notification from the outbox feed.
///
/// `image` is the raw record as written, so a malformed record surfaces as
/// a deserialization failure at the consumer instead of breaking the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub position: FeedPosition,
    pub kind: ChangeKind,
    pub image: serde_json::Value,
}

/// An outbox event whose dispatch keeps failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub event: OutboxEvent,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::InProgress => "IN_PROGRESS",
            IdempotencyStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IN_PROGRESS" => Some(IdempotencyStatus::InProgress),
            "COMPLETED" => Some(IdempotencyStatus::Completed),
            _ => None,
        }
    }
}

/// A deduplication record for one idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    /// SHA-256 of the request the key was first used with.
    pub fingerprint: String,
    /// Opaque token of the caller that currently owns the record.
    pub claim: String,
    /// Stored response, present only once `Completed`.
    pub response: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// A record is expired once `now` is past its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Outcome of [`IdempotencyStore::try_begin`].
#[derive(Debug, Clone, PartialEq)]
pub enum Begin {
    /// The caller owns the key: a fresh `IN_PROGRESS` record was written
    /// (either no record existed or the old one had expired).
    Started,
    /// A live record already exists for the key.
    Existing(IdempotencyRecord),
}

/// Current-state store for orders.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Writes a new order and its creation event as one atomic unit.
    ///
    /// Either both become visible or neither does.
    async fn create_order(&self, order: &Order, event: &OutboxEvent) -> Result<()>;

    /// Loads an order by id.
    async fn get_order(&self, order_id: AggregateId) -> Result<Option<Order>>;

    /// Sets the order's status, optionally recording a downstream event in
    /// the same atomic unit.
    ///
    /// The write is conditional: it succeeds only if the order exists and
    /// its current status is `status` itself or one of
    /// `status.allowed_predecessors()`. Fails with
    /// [`StoreError::OrderNotFound`](crate::StoreError::OrderNotFound) or
    /// [`StoreError::ConditionFailed`](crate::StoreError::ConditionFailed)
    /// otherwise, in which case the event is not written either.
    async fn update_status_with_event(
        &self,
        order_id: AggregateId,
        status: OrderStatus,
        event: Option<&OutboxEvent>,
    ) -> Result<Order>;
}

/// Extension trait providing convenience methods for order stores.
#[async_trait]
pub trait OrderStoreExt: OrderStore {
    /// Sets the order's status without recording an event.
    async fn update_status(&self, order_id: AggregateId, status: OrderStatus) -> Result<Order> {
        self.update_status_with_event(order_id, status, None).await
    }
}

impl<T: OrderStore + ?Sized> OrderStoreExt for T {}

/// Store for outbox events and their change feed.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` feed entries with a position greater than
    /// `after`, in position order.
    async fn read_feed(&self, after: FeedPosition, limit: usize) -> Result<Vec<FeedEntry>>;

    /// Loads the current copy of an event.
    async fn get_event(&self, event_id: EventId) -> Result<Option<OutboxEvent>>;

    /// Returns all events recorded for an aggregate, oldest first.
    async fn events_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<OutboxEvent>>;

    /// Flips `processed` to true if it is currently false.
    ///
    /// Returns `true` if this call performed the flip and `false` if the
    /// event was already processed.
    async fn mark_processed(&self, event_id: EventId) -> Result<bool>;

    /// Records a failed dispatch attempt and returns the attempt count.
    async fn record_dispatch_failure(&self, event_id: EventId, error: &str) -> Result<u32>;

    /// Lists unprocessed events with at least `min_attempts` failed dispatches.
    async fn failed_events(&self, min_attempts: u32) -> Result<Vec<FailedEvent>>;

    /// Returns up to `limit` unprocessed events created before
    /// `created_before` with fewer than `max_attempts` failed dispatches,
    /// oldest first.
    ///
    /// Finds events whose feed entry the relay never saw, e.g. one committed
    /// after a later position had already been read.
    async fn unprocessed_events(
        &self,
        created_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>>;
}

/// Store for idempotency records.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claims `key` or returns the live record that holds it.
    ///
    /// A missing record, or one expired at `now`, is (over)written as
    /// `IN_PROGRESS` with the given fingerprint, claim token and expiry.
    async fn try_begin(
        &self,
        key: &str,
        fingerprint: &str,
        claim: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Begin>;

    /// Moves the record to `COMPLETED` with the response attached.
    ///
    /// Only the holder of `claim` may complete the record. Returns `false`
    /// and changes nothing if the record was reclaimed by someone else
    /// after expiring, or is gone.
    async fn complete(
        &self,
        key: &str,
        claim: &str,
        response: &serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Deletes the record so the key can be used again.
    ///
    /// Like [`complete`](Self::complete), a no-op returning `false` unless
    /// the record is still held by `claim`.
    async fn release(&self, key: &str, claim: &str) -> Result<bool>;

    /// Deletes records expired at `now` and returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_position_previous_saturates() {
        assert_eq!(FeedPosition::new(5).previous(), FeedPosition::new(4));
        assert_eq!(FeedPosition::initial().previous(), FeedPosition::initial());
    }

    #[test]
    fn change_kind_parses_its_own_names() {
        for kind in [ChangeKind::Insert, ChangeKind::Modify, ChangeKind::Remove] {
            assert_eq!(ChangeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChangeKind::parse("UPSERT"), None);
    }

    #[test]
    fn idempotency_record_expiry_is_strict() {
        let now = Utc::now();
        let record = IdempotencyRecord {
            key: "k".to_string(),
            status: IdempotencyStatus::InProgress,
            fingerprint: String::new(),
            claim: "c".to_string(),
            response: None,
            expires_at: now,
        };
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn idempotency_status_round_trip() {
        for status in [IdempotencyStatus::InProgress, IdempotencyStatus::Completed] {
            assert_eq!(IdempotencyStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }
}
