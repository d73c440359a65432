//! Generic transactional outbox.
//!
//! Every producing service keeps a table named `outbox` with this shape
//! (see each service's `migrations/0001_init.sql`):
//!
//! ```sql
//! CREATE TABLE outbox (
//!     outbox_id       UUID PRIMARY KEY,
//!     aggregate_type  TEXT NOT NULL,
//!     aggregate_id    UUID NOT NULL,
//!     event_type      TEXT NOT NULL,
//!     routing_key     TEXT NOT NULL,
//!     payload         JSONB NOT NULL,
//!     status          TEXT NOT NULL DEFAULT 'pending',
//!     retry_count     INT NOT NULL DEFAULT 0,
//!     idempotency_key TEXT UNIQUE,
//!     created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     claimed_at      TIMESTAMPTZ,
//!     processed_at    TIMESTAMPTZ
//! );
//! CREATE INDEX outbox_pending_idx ON outbox (status, created_at)
//!     WHERE processed_at IS NULL;
//! ```
//!
//! The row is written in the same transaction as the aggregate it records
//! (callers pass their own `&mut Transaction<'_, Postgres>` to [`enqueue`]);
//! a separate poller drains rows to the bus via [`claim_batch`] +
//! [`mark_sent`]/[`mark_failed`], giving at-least-once delivery with
//! ordering preserved only within a single `aggregate_id`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::Postgres;
use sqlx::{PgPool, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub outbox_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub routing_key: String,
    pub payload: Value,
    /// Optional application-supplied idempotency key; when set, re-enqueuing
    /// the same key is a silent no-op rather than a duplicate row.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub outbox_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub routing_key: String,
    pub payload: Value,
    pub status: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Inserts one outbox row as part of an existing transaction. The caller
/// commits; this never commits on its own. Returns `false` if the row was a
/// no-op duplicate of an existing `idempotency_key`.
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    rec: &NewOutboxRecord,
) -> Result<bool> {
    let row = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO outbox
            (outbox_id, aggregate_type, aggregate_id, event_type, routing_key, payload, idempotency_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (idempotency_key) DO NOTHING
        RETURNING outbox_id
        "#,
    )
    .bind(rec.outbox_id)
    .bind(&rec.aggregate_type)
    .bind(rec.aggregate_id)
    .bind(&rec.event_type)
    .bind(&rec.routing_key)
    .bind(&rec.payload)
    .bind(&rec.idempotency_key)
    .fetch_optional(&mut **tx)
    .await
    .context("outbox enqueue failed")?;

    Ok(row.is_some())
}

/// Claims up to `batch_size` pending rows for delivery, skipping rows locked
/// by another poller. Safe to call concurrently from multiple poller
/// instances: `FOR UPDATE SKIP LOCKED` ensures no two pollers claim the same
/// row.
pub async fn claim_batch(pool: &PgPool, batch_size: i64) -> Result<Vec<OutboxRow>> {
    let rows = sqlx::query_as::<_, OutboxRow>(
        r#"
        WITH to_claim AS (
            SELECT outbox_id
            FROM outbox
            WHERE status = 'pending' AND processed_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE outbox
        SET status = 'claimed', claimed_at = now(), updated_at = now()
        WHERE outbox_id IN (SELECT outbox_id FROM to_claim)
        RETURNING outbox_id, aggregate_type, aggregate_id, event_type, routing_key,
                  payload, status, retry_count, created_at
        "#,
    )
    .bind(batch_size)
    .fetch_all(pool)
    .await
    .context("outbox claim_batch failed")?;

    Ok(rows)
}

/// Marks a row delivered. Returns `true` if a row actually transitioned
/// (idempotent against repeat calls on an already-sent row).
pub async fn mark_sent(pool: &PgPool, outbox_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE outbox
        SET status = 'sent', processed_at = now(), updated_at = now()
        WHERE outbox_id = $1 AND status = 'claimed'
        "#,
    )
    .bind(outbox_id)
    .execute(pool)
    .await
    .context("outbox mark_sent failed")?;

    Ok(result.rows_affected() > 0)
}

/// Records a failed delivery attempt. Increments `retry_count`; once it
/// reaches `max_retries` the row is marked `poisoned` and left out of future
/// claims (an operator must intervene). Returns the row's status after the
/// update.
pub async fn mark_failed(pool: &PgPool, outbox_id: Uuid, max_retries: u32) -> Result<String> {
    let status = sqlx::query_scalar::<_, String>(
        r#"
        UPDATE outbox
        SET
            retry_count = retry_count + 1,
            status = CASE
                WHEN retry_count + 1 >= $2 THEN 'poisoned'
                ELSE 'pending'
            END,
            claimed_at = NULL,
            updated_at = now()
        WHERE outbox_id = $1
        RETURNING status
        "#,
    )
    .bind(outbox_id)
    .bind(max_retries as i32)
    .fetch_one(pool)
    .await
    .context("outbox mark_failed failed")?;

    if status == "poisoned" {
        tracing::error!(%outbox_id, "outbox row exhausted retries, marked poisoned");
    }

    Ok(status)
}

/// Releases a claim without recording a failure, used when a poller crashes
/// or shuts down mid-batch so another poller can retry the row immediately.
pub async fn release_claim(pool: &PgPool, outbox_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE outbox
        SET status = 'pending', claimed_at = NULL, updated_at = now()
        WHERE outbox_id = $1 AND status = 'claimed'
        "#,
    )
    .bind(outbox_id)
    .execute(pool)
    .await
    .context("outbox release_claim failed")?;

    Ok(result.rows_affected() > 0)
}

/// Deletes sent rows older than `retention_days`. Intended to be called
/// periodically by the poller (spec §4.1 names a 7-day retention window).
pub async fn purge_sent_older_than(pool: &PgPool, retention_days: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM outbox
        WHERE status = 'sent' AND processed_at < now() - ($1 || ' days')::interval
        "#,
    )
    .bind(retention_days.to_string())
    .execute(pool)
    .await
    .context("outbox purge failed")?;

    Ok(result.rows_affected())
}
