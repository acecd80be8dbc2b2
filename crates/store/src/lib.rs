//! Persistence for orders, outbox events and idempotency records.
//!
//! Three narrow capabilities are defined as traits:
//! - [`OrderStore`]: current-state order records with the atomic
//!   order + outbox write and conditional status updates
//! - [`OutboxStore`]: outbox events, their ordered change feed and relay
//!   bookkeeping
//! - [`IdempotencyStore`]: per-key deduplication records with expiry
//!
//! [`InMemoryStore`] and [`PostgresStore`] implement all three.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    Begin, ChangeKind, FailedEvent, FeedEntry, FeedPosition, IdempotencyRecord, IdempotencyStatus,
    IdempotencyStore, OrderStore, OrderStoreExt, OutboxStore,
};
