//! Saga pattern implementation for order fulfillment.
//!
//! The order fulfillment saga follows these steps:
//! 1. Reserve inventory
//! 2. Process payment
//! 3. Send notification
//!
//! Each step moves the order along its status graph and records the
//! matching outbox event in the same write. If inventory or payment fails,
//! acquired effects are compensated in reverse order and the order ends in
//! `FAILED`. A failed notification still completes the order.
//!
//! [`LocalWorkflowEngine`] runs executions on tokio tasks and is what the
//! outbox relay starts for every `ORDER_CREATED` event.

pub mod compensation;
pub mod context;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod services;
pub mod steps;

pub use compensation::{
    CompensationAction, CompensationEntry, CompensationOutcome, CompensationStack,
};
pub use context::{NotificationStatus, SagaContext};
pub use engine::LocalWorkflowEngine;
pub use error::{Result, SagaError};
pub use orchestrator::{DEFAULT_STEP_TIMEOUT, SagaConfig, SagaOrchestrator, SagaOutcome};
pub use services::{
    InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
    InventoryService, NotificationReceipt, NotificationService, PaymentReceipt, PaymentService,
    Reservation,
};
pub use steps::{CompensationReport, SagaStep, StepResult};
