//! Workflow engine trait and in-memory implementation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Identifier the engine assigns to a started execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A workflow-execution engine that starts named executions.
///
/// Execution names are unique: starting a name twice fails with
/// [`RelayError::ExecutionAlreadyExists`].
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Starts an execution called `name` with the given input document.
    async fn start_execution(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<ExecutionId, RelayError>;
}

/// A started execution recorded by [`InMemoryWorkflowEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExecution {
    pub execution_id: ExecutionId,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Default)]
struct InMemoryWorkflowState {
    executions: Vec<RecordedExecution>,
    names: HashSet<String>,
    start_calls: usize,
    fail_on_start: bool,
}

/// In-memory workflow engine for testing. Records executions without
/// running anything.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowEngine {
    state: Arc<Mutex<InMemoryWorkflowState>>,
}

impl InMemoryWorkflowEngine {
    /// Creates a new in-memory workflow engine.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryWorkflowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the engine to fail every start call.
    pub fn set_fail_on_start(&self, fail: bool) {
        self.lock().fail_on_start = fail;
    }

    /// Returns all executions started so far.
    pub fn executions(&self) -> Vec<RecordedExecution> {
        self.lock().executions.clone()
    }

    /// Returns the number of start calls, including rejected ones.
    pub fn start_calls(&self) -> usize {
        self.lock().start_calls
    }
}

#[async_trait]
impl WorkflowEngine for InMemoryWorkflowEngine {
    async fn start_execution(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<ExecutionId, RelayError> {
        let mut state = self.lock();
        state.start_calls += 1;

        if state.fail_on_start {
            return Err(RelayError::Engine("engine unavailable".to_string()));
        }
        if !state.names.insert(name.to_string()) {
            return Err(RelayError::ExecutionAlreadyExists(name.to_string()));
        }

        let execution_id = ExecutionId::new(format!("EXE-{:04}", state.executions.len() + 1));
        state.executions.push(RecordedExecution {
            execution_id: execution_id.clone(),
            name: name.to_string(),
            input,
        });

        Ok(execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_records_execution() {
        let engine = InMemoryWorkflowEngine::new();

        let id = engine
            .start_execution("order-1-event-1", serde_json::json!({"a": 1}))
            .await
            .unwrap();

        assert_eq!(id.as_str(), "EXE-0001");
        let executions = engine.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].name, "order-1-event-1");
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let engine = InMemoryWorkflowEngine::new();
        engine.start_execution("same", serde_json::Value::Null).await.unwrap();

        let err = engine
            .start_execution("same", serde_json::Value::Null)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::ExecutionAlreadyExists(name) if name == "same"));
        assert_eq!(engine.executions().len(), 1);
        assert_eq!(engine.start_calls(), 2);
    }

    #[tokio::test]
    async fn test_fail_on_start() {
        let engine = InMemoryWorkflowEngine::new();
        engine.set_fail_on_start(true);

        let result = engine.start_execution("x", serde_json::Value::Null).await;

        assert!(matches!(result, Err(RelayError::Engine(_))));
        assert!(engine.executions().is_empty());
    }
}
