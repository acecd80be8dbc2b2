//! In-process workflow engine running saga executions as tokio tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use relay::{ExecutionId, RelayError, WorkflowEngine};
use store::OrderStore;
use tokio::task::JoinHandle;

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::orchestrator::{SagaOrchestrator, SagaOutcome};
use crate::services::{InventoryService, NotificationService, PaymentService};

#[derive(Default)]
struct EngineState {
    executions: HashMap<String, ExecutionId>,
    handles: HashMap<String, JoinHandle<Result<SagaOutcome>>>,
}

/// Starts one saga execution per unique name.
///
/// Each execution runs on its own tokio task, so the steps of one order
/// never run concurrently. Reusing a name fails with
/// [`RelayError::ExecutionAlreadyExists`].
///
/// An engine built with [`new`](Self::new) detaches its tasks and only
/// logs their outcome. [`joinable`](Self::joinable) keeps every task handle
/// until it is joined.
pub struct LocalWorkflowEngine<S, I, P, N>
where
    S: OrderStore,
    I: InventoryService,
    P: PaymentService,
    N: NotificationService,
{
    orchestrator: Arc<SagaOrchestrator<S, I, P, N>>,
    state: Mutex<EngineState>,
    keep_handles: bool,
}

impl<S, I, P, N> LocalWorkflowEngine<S, I, P, N>
where
    S: OrderStore + 'static,
    I: InventoryService + 'static,
    P: PaymentService + 'static,
    N: NotificationService + 'static,
{
    pub fn new(orchestrator: SagaOrchestrator<S, I, P, N>) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            state: Mutex::new(EngineState::default()),
            keep_handles: false,
        }
    }

    /// Creates an engine whose executions can be awaited with
    /// [`join`](Self::join) and [`join_all`](Self::join_all).
    pub fn joinable(orchestrator: SagaOrchestrator<S, I, P, N>) -> Self {
        Self {
            keep_handles: true,
            ..Self::new(orchestrator)
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of executions started.
    pub fn execution_count(&self) -> usize {
        self.lock().executions.len()
    }

    /// Returns the execution id assigned to `name`, if started.
    pub fn execution(&self, name: &str) -> Option<ExecutionId> {
        self.lock().executions.get(name).cloned()
    }

    /// Returns the number of executions that can still be joined.
    pub fn joinable_count(&self) -> usize {
        self.lock().handles.len()
    }

    /// Waits for the execution called `name` to finish.
    ///
    /// Returns `None` if no such execution was started, it was already
    /// joined, or the engine detaches its tasks.
    pub async fn join(&self, name: &str) -> Option<Result<SagaOutcome>> {
        let handle = self.lock().handles.remove(name)?;
        Some(match handle.await {
            Ok(result) => result,
            Err(e) => Err(SagaError::Aborted(e.to_string())),
        })
    }

    /// Waits for every execution started so far.
    pub async fn join_all(&self) -> Vec<Result<SagaOutcome>> {
        let handles: Vec<_> = self.lock().handles.drain().map(|(_, h)| h).collect();
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(SagaError::Aborted(e.to_string())),
            });
        }
        outcomes
    }
}

#[async_trait]
impl<S, I, P, N> WorkflowEngine for LocalWorkflowEngine<S, I, P, N>
where
    S: OrderStore + 'static,
    I: InventoryService + 'static,
    P: PaymentService + 'static,
    N: NotificationService + 'static,
{
    async fn start_execution(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> std::result::Result<ExecutionId, RelayError> {
        let context = SagaContext::from_input(input)
            .map_err(|e| RelayError::Engine(format!("invalid execution input: {e}")))?;

        let mut state = self.lock();
        if state.executions.contains_key(name) {
            return Err(RelayError::ExecutionAlreadyExists(name.to_string()));
        }

        let execution_id = ExecutionId::new(uuid::Uuid::new_v4().to_string());
        let orchestrator = self.orchestrator.clone();
        let execution = name.to_string();
        let handle = tokio::spawn(async move {
            let result = orchestrator.run(context).await;
            match &result {
                Ok(outcome) => {
                    tracing::debug!(execution = %execution, completed = outcome.is_completed(), "saga execution finished");
                }
                Err(e) => {
                    tracing::error!(execution = %execution, error = %e, "saga execution failed");
                }
            }
            result
        });

        state.executions.insert(name.to_string(), execution_id.clone());
        if self.keep_handles {
            state.handles.insert(name.to_string(), handle);
        }
        tracing::info!(name, %execution_id, "saga execution started");

        Ok(execution_id)
    }
}
