//! Subsystem E consumers (spec §4.5) bound by notification-service.
//!
//! Two independent bindings share this process:
//!
//! - `donations.events` / `donation.pledgecreated` mirrors enough contact
//!   data (`pledge_contacts`) to later address a confirmation email —
//!   `payments.events` payloads carry only opaque ids, never PII, per the
//!   cross-service ownership rule in spec §3.
//! - `payments.events` / `payment.paymentstatus.captured` sends the
//!   donation-confirmed notification, deduplicated by `(pledge_ref,
//!   event_kind)` so repeat bus deliveries never produce a second email.
//!
//! Both loops follow the same shape as every consumer in this workspace:
//! decode-or-dead-letter, run the idempotent handler, ack on success, nack
//! with requeue on a transient failure.

use std::sync::Arc;

use don_bus::BusConnection;
use don_schemas::{DonationEventPayload, PaymentEventPayload};
use futures_util::StreamExt;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::HandlerError;
use crate::models::PledgeContactRow;
use crate::notifier::Notifier;

const DONATIONS_EXCHANGE: &str = "donations.events";
const CONTACT_QUEUE: &str = "notification-service.pledge-created";
const CONTACT_ROUTING_KEY: &str = "donation.pledgecreated";

const PAYMENTS_EXCHANGE: &str = "payments.events";
const NOTIFY_QUEUE: &str = "notification-service.payment-captured";
const NOTIFY_ROUTING_KEY: &str = "payment.paymentstatus.captured";

const CAPTURED_TEMPLATE: &str = "donation_captured";
const CAPTURED_EVENT_KIND: &str = "PaymentStatus.Captured";

/// Mirrors `PledgeContactRow`s off `donation.pledgecreated` so the capture
/// consumer below can resolve a recipient email without reaching into
/// donation-service's schema.
pub async fn run_contact_mirror(pool: PgPool, bus: Arc<BusConnection>) {
    run_loop(
        bus,
        DONATIONS_EXCHANGE,
        CONTACT_QUEUE,
        CONTACT_ROUTING_KEY,
        "notification-service.mirror",
        move |delivery_data: Vec<u8>| {
            let pool = pool.clone();
            async move {
                let payload: DonationEventPayload = serde_json::from_slice(&delivery_data)
                    .map_err(|e| HandlerError::Decode(e.to_string()))?;
                mirror_contact(&pool, &payload).await
            }
        },
    )
    .await;
}

/// Sends the donation-confirmed notification on `payment.paymentstatus.captured`,
/// resolving the recipient against the `pledge_contacts` mirror and
/// deduplicating via the `(pledge_ref, event_kind)` uniqueness constraint.
pub async fn run_capture_notifier(pool: PgPool, bus: Arc<BusConnection>, notifier: Arc<dyn Notifier>) {
    run_loop(
        bus,
        PAYMENTS_EXCHANGE,
        NOTIFY_QUEUE,
        NOTIFY_ROUTING_KEY,
        "notification-service.notify",
        move |delivery_data: Vec<u8>| {
            let pool = pool.clone();
            let notifier = notifier.clone();
            async move {
                let payload: PaymentEventPayload = serde_json::from_slice(&delivery_data)
                    .map_err(|e| HandlerError::Decode(e.to_string()))?;
                notify_capture(&pool, notifier.as_ref(), &payload).await
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
pub async fn mirror_contact(pool: &PgPool, payload: &DonationEventPayload) -> Result<(), HandlerError> {
    sqlx::query(
        r#"
        INSERT INTO pledge_contacts (pledge_id, campaign_id, donor_email, amount_cents, currency)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (pledge_id) DO NOTHING
        "#,
    )
    .bind(payload.pledge_id)
    .bind(payload.campaign_id)
    .bind(&payload.donor_email)
    .bind(payload.amount_cents)
    .bind(&payload.currency)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn notify_capture(
    pool: &PgPool,
    notifier: &dyn Notifier,
    payload: &PaymentEventPayload,
) -> Result<(), HandlerError> {
    let contact: Option<PledgeContactRow> = sqlx::query_as(
        r#"
        SELECT pledge_id, campaign_id, donor_email, amount_cents, currency, created_at
        FROM pledge_contacts WHERE pledge_id = $1
        "#,
    )
    .bind(payload.pledge_id)
    .fetch_optional(pool)
    .await?;

    let Some(contact) = contact else {
        tracing::warn!(pledge_id = %payload.pledge_id, "captured payment for pledge with no contact mirror yet, requeueing");
        return Err(HandlerError::Transient(anyhow::anyhow!(
            "pledge contact not yet mirrored"
        )));
    };

    // Claim the dedup slot before sending: the unique constraint on
    // (pledge_ref, event_kind) is the source of truth, not a fire-then-record
    // pattern that could double-send under a crash between the two. The
    // claimed row starts 'pending', not 'sent' — a redelivery that lands
    // after a failed or crashed send must still retry, so only a row
    // already flipped to 'sent' counts as a duplicate to skip.
    let claimed = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO notifications (notification_id, pledge_ref, event_kind, recipient_email, template_id, status)
        VALUES ($1, $2, $3, $4, $5, 'pending')
        ON CONFLICT (pledge_ref, event_kind) DO NOTHING
        RETURNING notification_id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(payload.pledge_id)
    .bind(CAPTURED_EVENT_KIND)
    .bind(&contact.donor_email)
    .bind(CAPTURED_TEMPLATE)
    .fetch_optional(pool)
    .await?;

    let notification_id = match claimed {
        Some(id) => id,
        None => {
            let existing = sqlx::query_as::<_, (Uuid, String)>(
                "SELECT notification_id, status FROM notifications WHERE pledge_ref = $1 AND event_kind = $2",
            )
            .bind(payload.pledge_id)
            .bind(CAPTURED_EVENT_KIND)
            .fetch_one(pool)
            .await?;

            if existing.1 == "sent" {
                tracing::info!(
                    pledge_id = %payload.pledge_id,
                    event_kind = CAPTURED_EVENT_KIND,
                    "notification already sent, skipping duplicate delivery"
                );
                return Ok(());
            }
            existing.0
        }
    };

    let data = serde_json::json!({
        "pledge_id": contact.pledge_id,
        "campaign_id": contact.campaign_id,
        "amount_cents": contact.amount_cents,
        "currency": contact.currency,
    });

    notifier
        .send(&contact.donor_email, CAPTURED_TEMPLATE, &data)
        .await
        .map_err(HandlerError::Transient)?;

    sqlx::query("UPDATE notifications SET status = 'sent', sent_at = now() WHERE notification_id = $1")
        .bind(notification_id)
        .execute(pool)
        .await?;

    Ok(())
}
