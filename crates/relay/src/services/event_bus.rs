//! Event bus trait with in-memory and logging implementations.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::RelayError;

/// Publishes events to downstream subscribers.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes one event with the given source, detail type and detail.
    async fn publish(
        &self,
        source: &str,
        detail_type: &str,
        detail: &serde_json::Value,
    ) -> Result<(), RelayError>;
}

/// An event accepted by [`InMemoryEventBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub source: String,
    pub detail_type: String,
    pub detail: serde_json::Value,
}

#[derive(Debug, Default)]
struct InMemoryBusState {
    published: Vec<PublishedEvent>,
    publish_calls: usize,
    fail_on_detail_type: Option<String>,
}

/// In-memory event bus for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<InMemoryBusState>>,
}

impl InMemoryEventBus {
    /// Creates a new in-memory event bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryBusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes publishing fail for events of one detail type.
    pub fn set_fail_on_detail_type(&self, detail_type: Option<&str>) {
        self.lock().fail_on_detail_type = detail_type.map(str::to_string);
    }

    /// Returns every event published so far.
    pub fn published(&self) -> Vec<PublishedEvent> {
        self.lock().published.clone()
    }

    /// Returns the number of publish calls, including failed ones.
    pub fn publish_calls(&self) -> usize {
        self.lock().publish_calls
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(
        &self,
        source: &str,
        detail_type: &str,
        detail: &serde_json::Value,
    ) -> Result<(), RelayError> {
        let mut state = self.lock();
        state.publish_calls += 1;

        if state.fail_on_detail_type.as_deref() == Some(detail_type) {
            return Err(RelayError::Bus(format!("rejected {detail_type}")));
        }

        state.published.push(PublishedEvent {
            source: source.to_string(),
            detail_type: detail_type.to_string(),
            detail: detail.clone(),
        });
        Ok(())
    }
}

/// Event bus that only writes each event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventBus;

#[async_trait]
impl EventBus for LoggingEventBus {
    async fn publish(
        &self,
        source: &str,
        detail_type: &str,
        detail: &serde_json::Value,
    ) -> Result<(), RelayError> {
        tracing::info!(source, detail_type, %detail, "event published");
        Ok(())
    }
}
