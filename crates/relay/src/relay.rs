//! Outbox relay: turns the at-least-once change feed into
//! effectively-once delivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::EventId;
use domain::OutboxEvent;
use futures_util::{StreamExt, stream};
use serde::Serialize;
use store::{ChangeKind, FeedEntry, FeedPosition, OutboxStore};
use tokio::sync::watch;

use crate::error::{RelayError, Result};
use crate::services::{EventBus, WorkflowEngine};

/// Default event-bus source for published outbox events.
pub const DEFAULT_BUS_SOURCE: &str = "orders.outbox";

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Pause between polls when the feed has no more entries.
    pub poll_interval: Duration,
    /// Maximum feed entries read per poll.
    pub batch_size: usize,
    /// Failed dispatches after which an event is surfaced to operators.
    pub max_attempts: u32,
    /// Maximum records dispatched concurrently within one batch.
    pub concurrency: usize,
    /// Source attached to every event-bus publication.
    pub bus_source: String,
    /// Pause between sweeps for unprocessed events the feed never delivered.
    pub sweep_interval: Duration,
    /// Age an unprocessed event must reach before a sweep dispatches it.
    pub sweep_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 25,
            max_attempts: 5,
            concurrency: 8,
            bus_source: DEFAULT_BUS_SOURCE.to_string(),
            sweep_interval: Duration::from_secs(30),
            sweep_grace: Duration::from_secs(60),
        }
    }
}

/// Where an event was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchTarget {
    Workflow,
    EventBus,
}

/// Why a record was not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Not an insertion notification.
    NotInsert,
    /// The image or the stored copy is already processed.
    AlreadyProcessed,
    /// The same event appeared earlier in the batch.
    DuplicateInBatch,
}

/// What happened to one feed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Dispatched {
        event_id: EventId,
        target: DispatchTarget,
        /// False if the processed flag could not be set; a redelivery
        /// will dispatch again.
        marked_processed: bool,
    },
    Skipped {
        reason: SkipReason,
    },
    /// The image could not be read as an outbox event. Logged and passed
    /// over, since redelivering it cannot succeed.
    Malformed {
        reason: String,
    },
    /// Dispatch failed and will be retried on redelivery.
    Failed {
        event_id: EventId,
        attempts: u32,
        error: String,
    },
    /// Dispatch failed `max_attempts` times. The event stays unprocessed
    /// and is listed for operators, but no longer holds back the feed.
    Surfaced {
        event_id: EventId,
        attempts: u32,
        error: String,
    },
}

/// Outcome of one feed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordReport {
    pub position: FeedPosition,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
}

/// Per-record outcomes of one batch, in feed order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub records: Vec<RecordReport>,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn dispatched(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Dispatched { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Skipped { .. }))
    }

    /// Records that will be retried on redelivery.
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Failed { .. }))
    }

    pub fn surfaced(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Surfaced { .. }))
    }

    pub fn malformed(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Malformed { .. }))
    }

    /// Position of the earliest record that must be redelivered.
    pub fn first_retryable_failure(&self) -> Option<FeedPosition> {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, RecordOutcome::Failed { .. }))
            .map(|r| r.position)
            .min()
    }

    /// The cursor to resume from after this batch.
    ///
    /// Stops just before the first retryable failure so that it and every
    /// later record are redelivered; otherwise advances past the batch.
    pub fn checkpoint(&self, previous: FeedPosition) -> FeedPosition {
        match self.first_retryable_failure() {
            Some(position) => position.previous().max(previous),
            None => self
                .records
                .iter()
                .map(|r| r.position)
                .max()
                .unwrap_or(previous)
                .max(previous),
        }
    }

    fn count(&self, predicate: impl Fn(&RecordOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| predicate(&r.outcome)).count()
    }
}

/// Polls the outbox feed and delivers each unprocessed event once in effect.
///
/// `ORDER_CREATED` starts a workflow execution named
/// `"{aggregate_id}-{event_id}"`; every other event type is published on
/// the event bus.
pub struct OutboxRelay<S: OutboxStore> {
    store: S,
    engine: Arc<dyn WorkflowEngine>,
    bus: Arc<dyn EventBus>,
    config: RelayConfig,
}

impl<S: OutboxStore> OutboxRelay<S> {
    /// Creates a new relay.
    pub fn new(
        store: S,
        engine: Arc<dyn WorkflowEngine>,
        bus: Arc<dyn EventBus>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            engine,
            bus,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Returns the deterministic workflow execution name for an event.
    pub fn execution_name(event: &OutboxEvent) -> String {
        format!("{}-{}", event.aggregate_id, event.event_id)
    }

    /// Reads one batch after `after` and processes it.
    pub async fn poll_once(&self, after: FeedPosition) -> Result<BatchReport> {
        let entries = self.store.read_feed(after, self.config.batch_size).await?;
        Ok(self.process_batch(entries).await)
    }

    /// Processes one batch of feed entries.
    ///
    /// Records are handled concurrently and independently; a failing record
    /// never aborts the others.
    #[tracing::instrument(skip(self, entries), fields(batch_size = entries.len()))]
    pub async fn process_batch(&self, entries: Vec<FeedEntry>) -> BatchReport {
        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(entries.len());
        let mut work = Vec::new();

        for entry in entries {
            if entry.kind != ChangeKind::Insert {
                records.push(RecordReport {
                    position: entry.position,
                    outcome: RecordOutcome::Skipped {
                        reason: SkipReason::NotInsert,
                    },
                });
                continue;
            }

            match serde_json::from_value::<OutboxEvent>(entry.image) {
                Ok(event) if !seen.insert(event.event_id) => records.push(RecordReport {
                    position: entry.position,
                    outcome: RecordOutcome::Skipped {
                        reason: SkipReason::DuplicateInBatch,
                    },
                }),
                Ok(event) => work.push((entry.position, event)),
                Err(e) => {
                    tracing::error!(position = %entry.position, error = %e, "malformed outbox record");
                    metrics::counter!("outbox_malformed_records_total").increment(1);
                    records.push(RecordReport {
                        position: entry.position,
                        outcome: RecordOutcome::Malformed {
                            reason: e.to_string(),
                        },
                    });
                }
            }
        }

        let processed: Vec<RecordReport> = stream::iter(work)
            .map(|(position, event)| async move {
                RecordReport {
                    position,
                    outcome: self.process_event(event).await,
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        records.extend(processed);
        records.sort_by_key(|r| r.position);

        let report = BatchReport { records };
        if !report.is_empty() {
            tracing::debug!(
                dispatched = report.dispatched(),
                skipped = report.skipped(),
                failed = report.failed(),
                surfaced = report.surfaced(),
                "outbox batch processed"
            );
        }
        report
    }

    /// Dispatches a stored event again, typically one surfaced to operators.
    #[tracing::instrument(skip(self))]
    pub async fn redrive(&self, event_id: EventId) -> Result<RecordOutcome> {
        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or(store::StoreError::EventNotFound(event_id))?;
        Ok(self.process_event(event).await)
    }

    /// Dispatches unprocessed events older than `sweep_grace` straight from
    /// the store.
    ///
    /// Feed positions are allocated before commit, so an entry can become
    /// visible below a cursor that has already moved past it. The sweep
    /// delivers such events; surfaced events are left to operators.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_unprocessed(&self) -> Result<Vec<RecordOutcome>> {
        let Some(created_before) = chrono::Duration::from_std(self.config.sweep_grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
        else {
            return Ok(Vec::new());
        };

        let events = self
            .store
            .unprocessed_events(
                created_before,
                self.config.max_attempts,
                self.config.batch_size,
            )
            .await?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let outcomes: Vec<RecordOutcome> = stream::iter(events)
            .map(|event| self.process_event(event))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let dispatched = outcomes
            .iter()
            .filter(|o| matches!(o, RecordOutcome::Dispatched { .. }))
            .count();
        tracing::warn!(
            found = outcomes.len(),
            dispatched,
            "swept unprocessed outbox events missed by the feed"
        );
        metrics::counter!("outbox_sweep_dispatched_total").increment(dispatched as u64);
        Ok(outcomes)
    }

    /// Polls until `shutdown` flips to true, returning the last checkpoint.
    ///
    /// Every `sweep_interval` it also runs
    /// [`sweep_unprocessed`](Self::sweep_unprocessed).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> FeedPosition {
        let mut cursor = FeedPosition::initial();
        let mut last_sweep = tokio::time::Instant::now();
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox relay started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut caught_up = true;
            match self.poll_once(cursor).await {
                Ok(report) => {
                    let next = report.checkpoint(cursor);
                    caught_up = report.len() < self.config.batch_size || next == cursor;
                    cursor = next;
                }
                Err(e) => tracing::error!(error = %e, "failed to read outbox feed"),
            }

            if last_sweep.elapsed() >= self.config.sweep_interval {
                if let Err(e) = self.sweep_unprocessed().await {
                    tracing::error!(error = %e, "failed to sweep unprocessed outbox events");
                }
                last_sweep = tokio::time::Instant::now();
            }

            if caught_up {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(checkpoint = %cursor, "outbox relay stopped");
        cursor
    }

    async fn process_event(&self, event: OutboxEvent) -> RecordOutcome {
        let event_id = event.event_id;

        if event.processed {
            return RecordOutcome::Skipped {
                reason: SkipReason::AlreadyProcessed,
            };
        }

        match self.store.get_event(event_id).await {
            Ok(Some(stored)) if stored.processed => {
                tracing::debug!(%event_id, "event already processed, skipping");
                metrics::counter!("outbox_redeliveries_skipped_total").increment(1);
                return RecordOutcome::Skipped {
                    reason: SkipReason::AlreadyProcessed,
                };
            }
            Ok(_) => {}
            Err(e) => return self.fail(&event, &RelayError::Store(e)).await,
        }

        let target = match self.dispatch(&event).await {
            Ok(target) => target,
            Err(e) => return self.fail(&event, &e).await,
        };

        metrics::counter!("outbox_events_dispatched_total").increment(1);
        let marked_processed = match self.store.mark_processed(event_id).await {
            Ok(flipped) => {
                if !flipped {
                    tracing::debug!(%event_id, "event was marked processed concurrently");
                }
                true
            }
            Err(e) => {
                tracing::warn!(%event_id, error = %e, "failed to mark event processed");
                false
            }
        };

        tracing::info!(
            %event_id,
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type,
            ?target,
            "outbox event dispatched"
        );

        RecordOutcome::Dispatched {
            event_id,
            target,
            marked_processed,
        }
    }

    async fn dispatch(&self, event: &OutboxEvent) -> Result<DispatchTarget> {
        if event.event_type.starts_saga() {
            let name = Self::execution_name(event);
            match self
                .engine
                .start_execution(&name, event.payload.clone())
                .await
            {
                Ok(execution_id) => {
                    tracing::debug!(%execution_id, name = %name, "workflow execution started");
                }
                Err(RelayError::ExecutionAlreadyExists(_)) => {
                    tracing::info!(name = %name, "workflow execution already started");
                }
                Err(e) => return Err(e),
            }
            Ok(DispatchTarget::Workflow)
        } else {
            self.bus
                .publish(
                    &self.config.bus_source,
                    event.event_type.as_str(),
                    &event.payload,
                )
                .await?;
            Ok(DispatchTarget::EventBus)
        }
    }

    async fn fail(&self, event: &OutboxEvent, error: &RelayError) -> RecordOutcome {
        let event_id = event.event_id;
        let error = error.to_string();
        metrics::counter!("outbox_dispatch_failures_total").increment(1);

        let attempts = match self.store.record_dispatch_failure(event_id, &error).await {
            Ok(attempts) => attempts,
            Err(e) => {
                tracing::warn!(%event_id, error = %e, "failed to record dispatch failure");
                0
            }
        };

        if attempts >= self.config.max_attempts {
            tracing::error!(
                %event_id,
                aggregate_id = %event.aggregate_id,
                event_type = %event.event_type,
                attempts,
                error = %error,
                "outbox event surfaced after repeated dispatch failures"
            );
            metrics::counter!("outbox_events_surfaced_total").increment(1);
            RecordOutcome::Surfaced {
                event_id,
                attempts,
                error,
            }
        } else {
            tracing::warn!(%event_id, attempts, error = %error, "outbox dispatch failed, will retry");
            RecordOutcome::Failed {
                event_id,
                attempts,
                error,
            }
        }
    }
}
