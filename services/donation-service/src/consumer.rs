//! Subsystem E consumer bound by donation-service itself (spec §4.5, §2
//! data-flow: "... gateway posts notifications -> (B) validates/transitions
//! -> emits `PaymentStatus.*` -> (D) invalidates cache").
//!
//! `pledges.status` is owned exclusively by this service (spec §3
//! "Ownership"), so the transition from `pending` to `confirmed` on capture
//! has to happen here, triggered by consuming payment-service's own outbox
//! event rather than by payment-service reaching into this schema directly.
//! This is the same internal transition the `PATCH /v1/donations/:id/status`
//! endpoint performs for an operator-driven flip; this consumer is just
//! another caller of that state change, driven by the bus instead of HTTP.

use std::sync::Arc;

use don_bus::BusConnection;
use don_cache::donation_key;
use don_outbox::NewOutboxRecord;
use don_schemas::{DonationEventPayload, PaymentEventPayload};
use futures_util::StreamExt;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::HandlerError;
use crate::models::PledgeRow;

const EXCHANGE: &str = "payments.events";
const QUEUE: &str = "donation-service.payment-captured";
const ROUTING_KEY: &str = "payment.paymentstatus.captured";
const CONFIRMED_STATUS: &str = "confirmed";

/// Marks the pledge behind a captured payment `confirmed` and re-emits
/// `PledgeStatusChanged` so downstream mirrors (totals-service,
/// notification-service) observe the new status the same way they observe
/// any other pledge status change.
pub async fn run(pool: PgPool, bus: Arc<BusConnection>, cache: Arc<Mutex<don_cache::CacheClient>>) {
    let channel = match bus.channel().await {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, "payment-capture consumer failed to open bus channel, exiting");
            return;
        }
    };

    if let Err(err) = don_bus::declare_topic_exchange(&channel, EXCHANGE).await {
        tracing::error!(error = %err, "failed to declare payments.events exchange, exiting");
        return;
    }

    if let Err(err) = don_bus::declare_consumer_queue(&channel, EXCHANGE, QUEUE, ROUTING_KEY).await {
        tracing::error!(error = %err, "failed to declare donation-service consumer queue, exiting");
        return;
    }

    let mut consumer = match don_bus::consume(&channel, QUEUE, "donation-service.confirm").await {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, "failed to start consuming, exiting");
            return;
        }
    };

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(error = %err, "bus delivery error, continuing");
                continue;
            }
        };

        let outcome = match serde_json::from_slice::<PaymentEventPayload>(&delivery.data) {
            Ok(payload) => confirm_pledge(&pool, &cache, &payload).await,
            Err(err) => Err(HandlerError::Decode(err.to_string())),
        };

        match outcome {
            Ok(()) => {
                let _ = don_bus::ack(&delivery).await;
            }
            Err(HandlerError::Decode(err)) => {
                tracing::error!(error = %err, "undecodable payment event, dead-lettering");
                let _ = don_bus::nack(&delivery, false).await;
            }
            Err(HandlerError::Transient(err)) => {
                tracing::warn!(error = %err, "pledge confirmation failed, requeueing");
                let _ = don_bus::nack(&delivery, true).await;
            }
        }
    }
}

/// Idempotent by construction: the `UPDATE ... WHERE status = 'pending'`
/// guard means a redelivered capture event that finds the pledge already
/// `confirmed` updates zero rows and emits no duplicate outbox event. It
/// also enforces spec §3's monotonic-status invariant directly — a pledge
/// that has already reached a terminal status (`confirmed`, `failed`,
/// `refunded`) can never be moved by a stray or reordered capture event,
/// since only a `pending` row matches the guard.
pub async fn confirm_pledge(
    pool: &PgPool,
    cache: &Arc<Mutex<don_cache::CacheClient>>,
    payload: &PaymentEventPayload,
) -> Result<(), HandlerError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, PledgeRow>(
        r#"
        UPDATE pledges
        SET status = $1, payment_intent_id = COALESCE(payment_intent_id, $2),
            version = version + 1, updated_at = now()
        WHERE pledge_id = $3 AND status = 'pending'
        RETURNING pledge_id, campaign_id, donor_email, amount_cents, currency, status,
                  payment_intent_id, version, created_at, updated_at
        "#,
    )
    .bind(CONFIRMED_STATUS)
    .bind(payload.payment_intent_id)
    .bind(payload.pledge_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tracing::debug!(
            pledge_id = %payload.pledge_id,
            "pledge already terminal or not found, skipping capture event"
        );
        tx.commit().await?;
        return Ok(());
    };

    let event_payload = DonationEventPayload {
        pledge_id: row.pledge_id,
        campaign_id: row.campaign_id,
        donor_email: row.donor_email.clone(),
        amount_cents: row.amount_cents,
        currency: row.currency.clone(),
        status: row.status.clone(),
        payment_intent_id: row.payment_intent_id,
        created_at: row.created_at,
        updated_at: row.updated_at,
    };

    don_outbox::enqueue(
        &mut tx,
        &NewOutboxRecord {
            outbox_id: Uuid::new_v4(),
            aggregate_type: "pledge".to_string(),
            aggregate_id: row.pledge_id,
            event_type: "PledgeStatusChanged".to_string(),
            routing_key: don_bus::routing_key("donation", "PledgeStatusChanged"),
            payload: serde_json::to_value(&event_payload).map_err(anyhow::Error::from)?,
            idempotency_key: None,
        },
    )
    .await?;

    tx.commit().await?;

    {
        let mut cache = cache.lock().await;
        let _ = cache.invalidate(&donation_key(&row.pledge_id)).await;
    }

    tracing::info!(pledge_id = %row.pledge_id, "pledge confirmed from captured payment");
    Ok(())
}
