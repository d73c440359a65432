//! Subsystem E consumers bound by totals-service (spec §4.4 write path,
//! §4.5).
//!
//! Two independent bindings share this process:
//!
//! - `donations.events` / `donation.pledgecreated` + `donation.pledgestatuschanged`
//!   mirror just the fields the read path needs into this service's own
//!   `pledge_mirror` table. Per spec §3 ("Ownership: ... never shared
//!   storage"), this service never queries donation-service's schema
//!   directly — everything T2/T3 aggregate over is this local copy.
//! - `payments.events` / `payment.paymentstatus.captured` invalidates the T1
//!   hot-cache key for the affected campaign, resolved against the same
//!   mirror.
//!
//! Both loops follow the same shape as every consumer in this workspace:
//! decode-or-dead-letter, run the idempotent handler, ack on success, nack
//! with requeue on a transient failure.

use std::sync::Arc;

use don_bus::BusConnection;
use don_cache::{campaign_totals_key, CacheClient};
use don_schemas::{DonationEventPayload, PaymentEventPayload};
use futures_util::StreamExt;
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::error::HandlerError;

const DONATIONS_EXCHANGE: &str = "donations.events";
const MIRROR_CREATED_QUEUE: &str = "totals-service.pledge-created";
const MIRROR_CREATED_ROUTING_KEY: &str = "donation.pledgecreated";
const MIRROR_STATUS_QUEUE: &str = "totals-service.pledge-status-changed";
const MIRROR_STATUS_ROUTING_KEY: &str = "donation.pledgestatuschanged";

const PAYMENTS_EXCHANGE: &str = "payments.events";
const INVALIDATE_QUEUE: &str = "totals-service.payment-captured";
const INVALIDATE_ROUTING_KEY: &str = "payment.paymentstatus.captured";

/// Mirrors `donation.pledgecreated` into `pledge_mirror` (initial row) and
/// `donation.pledgestatuschanged` (status/amount updates as the pledge
/// moves toward `confirmed`) so T2/T3 have something local to aggregate.
pub async fn run_mirror(pool: PgPool, bus: Arc<BusConnection>) {
    let created = {
        let pool = pool.clone();
        let bus = bus.clone();
        run_loop(
            bus,
            DONATIONS_EXCHANGE,
            MIRROR_CREATED_QUEUE,
            MIRROR_CREATED_ROUTING_KEY,
            "totals-service.mirror-created",
            move |data: Vec<u8>| {
                let pool = pool.clone();
                async move {
                    let payload: DonationEventPayload = serde_json::from_slice(&data)
                        .map_err(|e| HandlerError::Decode(e.to_string()))?;
                    upsert_mirror(&pool, &payload).await
                }
            },
        )
    };

    let status_changed = run_loop(
        bus,
        DONATIONS_EXCHANGE,
        MIRROR_STATUS_QUEUE,
        MIRROR_STATUS_ROUTING_KEY,
        "totals-service.mirror-status",
        move |data: Vec<u8>| {
            let pool = pool.clone();
            async move {
                let payload: DonationEventPayload = serde_json::from_slice(&data)
                    .map_err(|e| HandlerError::Decode(e.to_string()))?;
                upsert_mirror(&pool, &payload).await
            }
        },
    );

    tokio::join!(created, status_changed);
}

/// Invalidates the T1 cache key for the campaign behind a captured payment.
pub async fn run_invalidate(pool: PgPool, bus: Arc<BusConnection>, cache: Arc<Mutex<CacheClient>>) {
    run_loop(
        bus,
        PAYMENTS_EXCHANGE,
        INVALIDATE_QUEUE,
        INVALIDATE_ROUTING_KEY,
        "totals-service.invalidate",
        move |data: Vec<u8>| {
            let pool = pool.clone();
            let cache = cache.clone();
            async move {
                let payload: PaymentEventPayload = serde_json::from_slice(&data)
                    .map_err(|e| HandlerError::Decode(e.to_string()))?;
                invalidate(&pool, &cache, &payload).await
            }
        },
    )
    .await;
}

async fn run_loop<F, Fut>(
    bus: Arc<BusConnection>,
    exchange: &str,
    queue: &str,
    routing_key: &str,
    consumer_tag: &str,
    handler: F,
) where
    F: Fn(Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = Result<(), HandlerError>>,
{
    let channel = match bus.channel().await {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, queue, "failed to open bus channel, exiting");
            return;
        }
    };

    if let Err(err) = don_bus::declare_topic_exchange(&channel, exchange).await {
        tracing::error!(error = %err, exchange, "failed to declare exchange, exiting");
        return;
    }

    if let Err(err) = don_bus::declare_consumer_queue(&channel, exchange, queue, routing_key).await {
        tracing::error!(error = %err, queue, "failed to declare consumer queue, exiting");
        return;
    }

    let mut consumer = match don_bus::consume(&channel, queue, consumer_tag).await {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, queue, "failed to start consuming, exiting");
            return;
        }
    };

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(error = %err, queue, "bus delivery error, continuing");
                continue;
            }
        };

        match handler(delivery.data.clone()).await {
            Ok(()) => {
                let _ = don_bus::ack(&delivery).await;
            }
            Err(HandlerError::Decode(err)) => {
                tracing::error!(error = %err, queue, "undecodable event, dead-lettering");
                let _ = don_bus::nack(&delivery, false).await;
            }
            Err(HandlerError::Transient(err)) => {
                tracing::warn!(error = %err, queue, "handler failed, requeueing");
                let _ = don_bus::nack(&delivery, true).await;
            }
        }
    }
}

/// Exposed (not just used internally) so integration tests can drive the
/// handler directly against a migrated pool without standing up a broker.
pub async fn upsert_mirror(pool: &PgPool, payload: &DonationEventPayload) -> Result<(), HandlerError> {
    sqlx::query(
        r#"
        INSERT INTO pledge_mirror
            (pledge_id, campaign_id, donor_email, amount_cents, currency, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (pledge_id) DO UPDATE SET
            status = EXCLUDED.status,
            amount_cents = EXCLUDED.amount_cents,
            currency = EXCLUDED.currency,
            updated_at = EXCLUDED.updated_at
        WHERE pledge_mirror.updated_at <= EXCLUDED.updated_at
        "#,
    )
    .bind(payload.pledge_id)
    .bind(payload.campaign_id)
    .bind(&payload.donor_email)
    .bind(payload.amount_cents)
    .bind(&payload.currency)
    .bind(&payload.status)
    .bind(payload.created_at)
    .bind(payload.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn invalidate(
    pool: &PgPool,
    cache: &Arc<Mutex<CacheClient>>,
    payload: &PaymentEventPayload,
) -> Result<(), HandlerError> {
    let campaign_id: Option<uuid::Uuid> =
        sqlx::query_scalar("SELECT campaign_id FROM pledge_mirror WHERE pledge_id = $1")
            .bind(payload.pledge_id)
            .fetch_optional(pool)
            .await?;

    let Some(campaign_id) = campaign_id else {
        tracing::warn!(pledge_id = %payload.pledge_id, "captured payment for unmirrored pledge, nothing to invalidate");
        return Ok(());
    };

    let key = campaign_totals_key(&campaign_id);
    let mut cache = cache.lock().await;
    cache
        .invalidate(&key)
        .await
        .map_err(HandlerError::Transient)?;

    tracing::debug!(campaign_id = %campaign_id, "invalidated T1 totals cache after capture");
    Ok(())
}
