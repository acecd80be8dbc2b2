use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, EventId};
use domain::{CustomerId, Money, Order, OrderItem, OrderStatus, OutboxEvent};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{
        Begin, ChangeKind, FailedEvent, FeedEntry, FeedPosition, IdempotencyRecord,
        IdempotencyStatus, IdempotencyStore, OrderStore, OutboxStore,
    },
};

const ORDER_COLUMNS: &str =
    "order_id, customer_id, items, total_amount, status, created_at, updated_at";

const EVENT_COLUMNS: &str = "event_id, aggregate_id, event_type, payload, created_at, processed";

/// Attempts at claiming an idempotency key when the holder vanishes between
/// the conditional insert and the read-back.
const BEGIN_ATTEMPTS: usize = 3;

/// PostgreSQL-backed implementation of all three stores.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let items: Vec<OrderItem> = serde_json::from_value(row.try_get("items")?)?;
        let status: String = row.try_get("status")?;
        let status = status.parse::<OrderStatus>().map_err(StoreError::Corrupt)?;

        Ok(Order::from_parts(
            AggregateId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            CustomerId::new(row.try_get::<String, _>("customer_id")?),
            items,
            Money::from_cents(row.try_get("total_amount")?),
            status,
            row.try_get("created_at")?,
            row.try_get("updated_at")?,
        ))
    }

    fn row_to_event(row: &PgRow) -> Result<OutboxEvent> {
        let event_type: String = row.try_get("event_type")?;

        Ok(OutboxEvent {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            event_type: event_type.parse().map_err(StoreError::Corrupt)?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            processed: row.try_get("processed")?,
        })
    }

    fn row_to_idempotency(row: PgRow) -> Result<IdempotencyRecord> {
        let status: String = row.try_get("status")?;

        Ok(IdempotencyRecord {
            key: row.try_get("key")?,
            status: IdempotencyStatus::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("idempotency status {status}")))?,
            fingerprint: row.try_get("fingerprint")?,
            claim: row.try_get("claim_token")?,
            response: row.try_get("response")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    async fn insert_event(tx: &mut Transaction<'_, Postgres>, event: &OutboxEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (event_id, aggregate_id, event_type, payload, created_at, processed)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.event_id.as_uuid())
        .bind(event.aggregate_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(event.created_at)
        .bind(event.processed)
        .execute(&mut **tx)
        .await
        .map_err(|e| Self::map_unique_violation(e, event.event_id.to_string()))?;

        Ok(())
    }

    fn map_unique_violation(e: sqlx::Error, key: String) -> StoreError {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.is_unique_violation()
        {
            return StoreError::Duplicate(key);
        }
        StoreError::Database(e)
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    #[tracing::instrument(skip(self, order, event), fields(order_id = %order.order_id()))]
    async fn create_order(&self, order: &Order, event: &OutboxEvent) -> Result<()> {
        let items = serde_json::to_value(order.items())?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (order_id, customer_id, items, total_amount, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(order.order_id().as_uuid())
        .bind(order.customer_id().as_str())
        .bind(items)
        .bind(order.total_amount().cents())
        .bind(order.status().as_str())
        .bind(order.created_at())
        .bind(order.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::map_unique_violation(e, order.order_id().to_string()))?;

        Self::insert_event(&mut tx, event).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, order_id: AggregateId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1"))
            .bind(order_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_order).transpose()
    }

    #[tracing::instrument(skip(self, event))]
    async fn update_status_with_event(
        &self,
        order_id: AggregateId,
        status: OrderStatus,
        event: Option<&OutboxEvent>,
    ) -> Result<Order> {
        let predecessors: Vec<String> = status
            .allowed_predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE orders
            SET status = $2, updated_at = NOW()
            WHERE order_id = $1 AND (status = $2 OR status = ANY($3))
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(order_id.as_uuid())
        .bind(status.as_str())
        .bind(predecessors)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            let current = self
                .get_order(order_id)
                .await?
                .ok_or(StoreError::OrderNotFound(order_id))?;
            return Err(StoreError::ConditionFailed {
                order_id,
                current: current.status(),
                to: status,
            });
        };
        let order = Self::row_to_order(row)?;

        if let Some(event) = event {
            Self::insert_event(&mut tx, event).await?;
        }

        tx.commit().await?;
        Ok(order)
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn read_feed(&self, after: FeedPosition, limit: usize) -> Result<Vec<FeedEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT position, kind, image
            FROM outbox_feed
            WHERE position > $1
            ORDER BY position ASC
            LIMIT $2
            "#,
        )
        .bind(after.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<FeedEntry> {
                let kind: String = row.try_get("kind")?;
                Ok(FeedEntry {
                    position: FeedPosition::new(row.try_get("position")?),
                    kind: ChangeKind::parse(&kind)
                        .ok_or_else(|| StoreError::Corrupt(format!("feed kind {kind}")))?,
                    image: row.try_get("image")?,
                })
            })
            .collect()
    }

    async fn get_event(&self, event_id: EventId) -> Result<Option<OutboxEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE event_id = $1"
        ))
        .bind(event_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_event).transpose()
    }

    async fn events_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE aggregate_id = $1 ORDER BY seq ASC"
        ))
        .bind(aggregate_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn mark_processed(&self, event_id: EventId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed = TRUE, processed_at = NOW()
            WHERE event_id = $1 AND processed = FALSE
            "#,
        )
        .bind(event_id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_event(event_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::EventNotFound(event_id)),
        }
    }

    async fn record_dispatch_failure(&self, event_id: EventId, error: &str) -> Result<u32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET dispatch_attempts = dispatch_attempts + 1, last_error = $2
            WHERE event_id = $1
            RETURNING dispatch_attempts
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        let attempts = attempts.ok_or(StoreError::EventNotFound(event_id))?;
        Ok(u32::try_from(attempts).unwrap_or(0))
    }

    async fn failed_events(&self, min_attempts: u32) -> Result<Vec<FailedEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}, dispatch_attempts, last_error
            FROM outbox_events
            WHERE processed = FALSE AND dispatch_attempts > 0 AND dispatch_attempts >= $1
            ORDER BY seq ASC
            "#
        ))
        .bind(i64::from(min_attempts))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<FailedEvent> {
                let attempts: i32 = row.try_get("dispatch_attempts")?;
                Ok(FailedEvent {
                    event: Self::row_to_event(row)?,
                    attempts: u32::try_from(attempts).unwrap_or(0),
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect()
    }

    async fn unprocessed_events(
        &self,
        created_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM outbox_events
            WHERE processed = FALSE AND created_at < $1 AND dispatch_attempts < $2
            ORDER BY seq ASC
            LIMIT $3
            "#
        ))
        .bind(created_before)
        .bind(i64::from(max_attempts))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }
}

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn try_begin(
        &self,
        key: &str,
        fingerprint: &str,
        claim: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Begin> {
        for _ in 0..BEGIN_ATTEMPTS {
            let claimed: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO idempotency_records (key, status, fingerprint, claim_token, response, expires_at)
                VALUES ($1, 'IN_PROGRESS', $2, $3, NULL, $4)
                ON CONFLICT (key) DO UPDATE SET
                    status = 'IN_PROGRESS',
                    fingerprint = EXCLUDED.fingerprint,
                    claim_token = EXCLUDED.claim_token,
                    response = NULL,
                    expires_at = EXCLUDED.expires_at,
                    created_at = NOW()
                WHERE idempotency_records.expires_at < $5
                RETURNING key
                "#,
            )
            .bind(key)
            .bind(fingerprint)
            .bind(claim)
            .bind(expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            if claimed.is_some() {
                return Ok(Begin::Started);
            }

            let existing = sqlx::query(
                "SELECT key, status, fingerprint, claim_token, response, expires_at FROM idempotency_records WHERE key = $1",
            )
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = existing {
                return Ok(Begin::Existing(Self::row_to_idempotency(row)?));
            }
            tracing::debug!(key, "idempotency record released during claim, retrying");
        }

        Err(StoreError::Corrupt(format!(
            "idempotency key {key} could not be claimed"
        )))
    }

    async fn complete(
        &self,
        key: &str,
        claim: &str,
        response: &serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'COMPLETED', response = $3, expires_at = $4
            WHERE key = $1 AND claim_token = $2
            "#,
        )
        .bind(key)
        .bind(claim)
        .bind(response)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str, claim: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM idempotency_records WHERE key = $1 AND claim_token = $2")
                .bind(key)
                .bind(claim)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
