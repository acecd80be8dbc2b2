//! Outbox relay.
//!
//! Consumes the outbox change feed and delivers every unprocessed event
//! exactly once in effect: `ORDER_CREATED` starts the fulfillment workflow,
//! everything else is published on the event bus. Redeliveries are
//! recognised through the event's processed flag, and a record that keeps
//! failing is surfaced to operators instead of stalling the feed.

pub mod error;
pub mod relay;
pub mod services;

pub use error::{RelayError, Result};
pub use relay::{
    BatchReport, DEFAULT_BUS_SOURCE, DispatchTarget, OutboxRelay, RecordOutcome, RecordReport,
    RelayConfig, SkipReason,
};
pub use services::{
    EventBus, ExecutionId, InMemoryEventBus, InMemoryWorkflowEngine, LoggingEventBus,
    PublishedEvent, RecordedExecution, WorkflowEngine,
};
