//! Shared identifier types used across the order workspace.

pub mod types;

pub use types::{AggregateId, EventId};
