//! Delivery targets for outbox events.

pub mod event_bus;
pub mod workflow;

pub use event_bus::{EventBus, InMemoryEventBus, LoggingEventBus, PublishedEvent};
pub use workflow::{ExecutionId, InMemoryWorkflowEngine, RecordedExecution, WorkflowEngine};
