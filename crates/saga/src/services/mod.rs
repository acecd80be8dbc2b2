//! Business capabilities called by saga steps, with in-memory implementations.

pub mod inventory;
pub mod notification;
pub mod payment;

pub use inventory::{InMemoryInventoryService, InventoryService, Reservation};
pub use notification::{InMemoryNotificationService, NotificationReceipt, NotificationService};
pub use payment::{InMemoryPaymentService, PaymentReceipt, PaymentService};
