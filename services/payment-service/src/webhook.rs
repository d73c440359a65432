//! Webhook ingestion state machine (spec §4.2).
//!
//! Processing path:
//! 1. Derive the idempotency key (header, else body hash — never a
//!    timestamp, see `don_idempotency::derive_key`).
//! 2. Dual-layer idempotency check; a duplicate replays the cached response
//!    verbatim without touching `payment_intents` at all.
//! 3. Decode the normalized webhook payload.
//! 4. Lock the target `PaymentIntent` row (`SELECT ... FOR UPDATE`).
//! 5. Reject transitions that are either not in the fixed transition graph,
//!    or whose `event_timestamp` is older than the row's current
//!    `updated_at` (an out-of-order redelivery of an already-applied event).
//! 6. Apply the transition, write the audit row, enqueue the downstream
//!    event — all in the one transaction that holds the row lock.
//! 7. Commit, then cache whatever response was produced — success or
//!    rejection alike, since every one of those outcomes must replay
//!    identically on a repeat delivery.

use std::str::FromStr;

use don_idempotency::{CachedResponse, IdempotencyGuard, IdempotencyOutcome};
use don_outbox::NewOutboxRecord;
use don_schemas::{PaymentEventPayload, PaymentStatus};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{PaymentIntentRow, WebhookPayload};

pub struct WebhookResult {
    pub status: u16,
    pub body: serde_json::Value,
}

pub async fn process_webhook(
    pool: &PgPool,
    idempotency: &mut IdempotencyGuard,
    idempotency_header: Option<&str>,
    raw_body: &[u8],
    payload: WebhookPayload,
) -> Result<WebhookResult, ApiError> {
    let key = don_idempotency::derive_key(idempotency_header, raw_body);

    match idempotency
        .check_and_reserve(pool, &key)
        .await
        .map_err(ApiError::Transient)?
    {
        IdempotencyOutcome::Duplicate(Some(cached)) => {
            tracing::info!(idempotency_key = %key, "duplicate webhook delivery, replaying cached response");
            return Ok(WebhookResult {
                status: cached.status,
                body: cached.body,
            });
        }
        IdempotencyOutcome::Duplicate(None) => {
            return Err(ApiError::Conflict(
                "request with this idempotency key is already being processed".into(),
            ));
        }
        IdempotencyOutcome::New => {}
    }

    let new_status = PaymentStatus::from_str(&payload.new_status).map_err(ApiError::Validation)?;

    let outcome = apply_transition(pool, &payload, new_status).await?;

    idempotency
        .complete(
            pool,
            &key,
            &CachedResponse {
                status: outcome.status,
                body: outcome.body.clone(),
            },
        )
        .await
        .map_err(ApiError::Transient)?;

    Ok(outcome)
}

async fn apply_transition(
    pool: &PgPool,
    payload: &WebhookPayload,
    new_status: PaymentStatus,
) -> Result<WebhookResult, ApiError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, PaymentIntentRow>(
        r#"
        SELECT payment_intent_id, intent_ref, pledge_id, amount_cents, currency, status,
               gateway_label, gateway_snapshot, version, created_at, updated_at
        FROM payment_intents WHERE intent_ref = $1
        FOR UPDATE
        "#,
    )
    .bind(&payload.intent_ref)
    .fetch_optional(&mut *tx)
    .await?;

    let row = match row {
        Some(row) => row,
        None => {
            return Ok(WebhookResult {
                status: 404,
                body: json!({ "status": "not_found", "intent_ref": payload.intent_ref }),
            });
        }
    };

    let current_status =
        PaymentStatus::from_str(&row.status).map_err(|e| ApiError::Transient(anyhow::anyhow!(e)))?;

    if payload.event_timestamp < row.updated_at {
        tracing::info!(
            payment_intent_id = %row.payment_intent_id,
            event_timestamp = %payload.event_timestamp,
            updated_at = %row.updated_at,
            "out-of-order webhook event ignored"
        );
        return Ok(WebhookResult {
            status: 200,
            body: json!({ "status": "ignored", "reason": "out_of_order" }),
        });
    }

    if !current_status.can_transition_to(new_status) {
        return Ok(WebhookResult {
            status: 400,
            body: json!({ "status": "rejected", "reason": "invalid_transition" }),
        });
    }

    let updated = sqlx::query_as::<_, PaymentIntentRow>(
        r#"
        UPDATE payment_intents
        SET status = $1, version = version + 1, updated_at = $2,
            gateway_snapshot = COALESCE($3, gateway_snapshot)
        WHERE payment_intent_id = $4
        RETURNING payment_intent_id, intent_ref, pledge_id, amount_cents, currency, status,
                  gateway_label, gateway_snapshot, version, created_at, updated_at
        "#,
    )
    .bind(new_status.as_str())
    .bind(payload.event_timestamp)
    .bind(&payload.payload)
    .bind(row.payment_intent_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO payment_transitions
            (transition_id, payment_intent_id, from_status, to_status, version, event_timestamp)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(updated.payment_intent_id)
    .bind(current_status.as_str())
    .bind(new_status.as_str())
    .bind(updated.version)
    .bind(payload.event_timestamp)
    .execute(&mut *tx)
    .await?;

    let event_payload = PaymentEventPayload {
        payment_intent_id: updated.payment_intent_id,
        pledge_id: updated.pledge_id,
        amount_cents: updated.amount_cents,
        currency: updated.currency.clone(),
        status: updated.status.clone(),
        occurred_at: payload.event_timestamp,
    };

    don_outbox::enqueue(
        &mut tx,
        &NewOutboxRecord {
            outbox_id: Uuid::new_v4(),
            aggregate_type: "payment_intent".to_string(),
            aggregate_id: updated.payment_intent_id,
            event_type: format!("PaymentStatus{}", capitalize(new_status.as_str())),
            routing_key: don_bus::routing_key("payment", &format!("paymentstatus.{}", new_status.as_str())),
            payload: serde_json::to_value(&event_payload).map_err(anyhow::Error::from)?,
            idempotency_key: None,
        },
    )
    .await?;

    tx.commit().await?;

    tracing::info!(
        payment_intent_id = %updated.payment_intent_id,
        from = %current_status.as_str(),
        to = %new_status.as_str(),
        "payment intent transitioned"
    );

    Ok(WebhookResult {
        status: 200,
        body: json!({
            "status": "processed",
            "old_status": current_status.as_str(),
            "new_status": new_status.as_str(),
            "version": updated.version,
        }),
    })
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use don_schemas::PaymentStatus;

    #[test]
    fn transition_graph_matches_spec() {
        use PaymentStatus::*;
        assert!(Initiated.can_transition_to(Authorized));
        assert!(Initiated.can_transition_to(Failed));
        assert!(!Initiated.can_transition_to(Captured));
        assert!(Authorized.can_transition_to(Captured));
        assert!(Authorized.can_transition_to(Failed));
        assert!(Authorized.can_transition_to(Refunded));
        assert!(Captured.can_transition_to(Refunded));
        assert!(!Captured.can_transition_to(Authorized));
        assert!(!Failed.can_transition_to(Authorized));
        assert!(!Refunded.can_transition_to(Captured));
    }

    #[test]
    fn terminal_statuses_accept_no_further_transitions() {
        use PaymentStatus::*;
        for terminal in [Failed, Refunded] {
            for next in [Initiated, Authorized, Captured, Failed, Refunded] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }
}
