//! Compensation stack and its outcomes.

use domain::Money;
use serde::{Deserialize, Serialize};

use crate::steps::SagaStep;

/// The typed undo operation for an acquired effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationAction {
    ReleaseReservation { reservation_id: String },
    RefundPayment { payment_id: String, amount: Money },
}

impl CompensationAction {
    /// Past-tense description of the action once applied.
    pub fn description(&self) -> String {
        match self {
            Self::ReleaseReservation { reservation_id } => {
                format!("Released inventory {reservation_id}")
            }
            Self::RefundPayment { payment_id, .. } => format!("Refunded payment {payment_id}"),
        }
    }
}

/// One entry of the compensation stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationEntry {
    /// The forward step that acquired the effect.
    pub step: SagaStep,
    pub description: String,
    pub action: CompensationAction,
}

impl CompensationEntry {
    pub fn new(step: SagaStep, action: CompensationAction) -> Self {
        Self {
            step,
            description: action.description(),
            action,
        }
    }
}

/// Append-only stack of undo entries, consumed in reverse order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompensationStack(Vec<CompensationEntry>);

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: CompensationEntry) {
        self.0.push(entry);
    }

    /// Pops the top entry if it was pushed by `step`.
    ///
    /// Only the top is ever inspected, so entries can only leave the stack
    /// in reverse order of acquisition.
    pub fn pop_for(&mut self, step: SagaStep) -> Option<CompensationEntry> {
        match self.0.last() {
            Some(top) if top.step == step => self.0.pop(),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn entries(&self) -> &[CompensationEntry] {
        &self.0
    }
}

/// Result of compensating one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompensationOutcome {
    Applied {
        step: SagaStep,
        description: String,
    },
    /// The step had acquired nothing to undo.
    Skipped { step: SagaStep },
    Failed {
        step: SagaStep,
        description: String,
        reason: String,
    },
}

impl CompensationOutcome {
    pub fn step(&self) -> SagaStep {
        match self {
            Self::Applied { step, .. } | Self::Skipped { step } | Self::Failed { step, .. } => {
                *step
            }
        }
    }

    /// Human-readable line for logs and the `SAGA_FAILED` payload.
    pub fn summary(&self) -> String {
        match self {
            Self::Applied { description, .. } => description.clone(),
            Self::Skipped { step } => format!("Skipped {step}"),
            Self::Failed {
                description,
                reason,
                ..
            } => format!("Failed: {description} ({reason})"),
        }
    }
}
