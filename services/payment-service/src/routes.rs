use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use don_outbox::NewOutboxRecord;
use don_schemas::{PaymentEventPayload, PaymentStatus};
use serde_json::json;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{CreatePaymentIntentRequest, PaymentIntentResponse, PaymentIntentRow, RefundRequest, WebhookPayload};
use crate::state::AppState;
use crate::webhook;

pub fn build_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/payments/intent", post(create_intent))
        .route("/payments/:id", get(get_intent))
        .route("/payments/webhook", post(ingest_webhook))
        .route("/payments/:id/refund", post(refund));

    Router::new()
        .nest("/v1", v1)
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Result<&'static str, ApiError> {
    don_db::ping(&state.pool).await?;
    Ok("ok")
}

async fn create_intent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePaymentIntentRequest>,
) -> Result<(StatusCode, Json<PaymentIntentResponse>), ApiError> {
    if req.amount_cents <= 0 {
        return Err(ApiError::Validation("amount_cents must be positive".into()));
    }

    let payment_intent_id = Uuid::new_v4();
    let intent_ref = format!("pi_{}", Uuid::new_v4().simple());
    let row = sqlx::query_as::<_, PaymentIntentRow>(
        r#"
        INSERT INTO payment_intents (payment_intent_id, intent_ref, pledge_id, amount_cents, currency, status, gateway_label)
        VALUES ($1, $2, $3, $4, $5, 'initiated', $6)
        RETURNING payment_intent_id, intent_ref, pledge_id, amount_cents, currency, status,
                  gateway_label, gateway_snapshot, version, created_at, updated_at
        "#,
    )
    .bind(payment_intent_id)
    .bind(&intent_ref)
    .bind(req.pledge_id)
    .bind(req.amount_cents)
    .bind(&req.currency)
    .bind(req.gateway_label.as_deref().unwrap_or("stub"))
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(payment_intent_id = %row.payment_intent_id, "payment intent created");

    Ok((StatusCode::CREATED, Json(row.into())))
}

async fn get_intent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentIntentResponse>, ApiError> {
    let row = sqlx::query_as::<_, PaymentIntentRow>(
        r#"
        SELECT payment_intent_id, intent_ref, pledge_id, amount_cents, currency, status,
               gateway_label, gateway_snapshot, version, created_at, updated_at
        FROM payment_intents WHERE payment_intent_id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("payment intent {id} not found")))?;

    Ok(Json(row.into()))
}

async fn ingest_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let payload: WebhookPayload =
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(format!("invalid webhook body: {e}")))?;

    let idempotency_header = headers
        .get("X-Idempotency-Key")
        .and_then(|v| v.to_str().ok());

    let mut guard = state.idempotency.lock().await;
    let result = webhook::process_webhook(&state.pool, &mut guard, idempotency_header, &body, payload).await?;

    let status = StatusCode::from_u16(result.status).unwrap_or(StatusCode::OK);
    Ok((status, Json(result.body)))
}

/// Starts a refund: only a `CAPTURED` intent can be refunded (spec §6,
/// `/v1/payments/{id}/refund`: 400 if not CAPTURED). This is an
/// internally-triggered transition, not a gateway webhook, so it goes
/// straight through the state machine's apply step with `event_timestamp =
/// now()` rather than through the idempotency guard.
async fn refund(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(_req): Json<RefundRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut tx = state.pool.begin().await?;

    let row = sqlx::query_as::<_, PaymentIntentRow>(
        r#"
        SELECT payment_intent_id, intent_ref, pledge_id, amount_cents, currency, status,
               gateway_label, gateway_snapshot, version, created_at, updated_at
        FROM payment_intents WHERE payment_intent_id = $1
        FOR UPDATE
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("payment intent {id} not found")))?;

    if row.status != PaymentStatus::Captured.as_str() {
        return Err(ApiError::Validation(format!(
            "payment intent {id} is {}, not captured",
            row.status
        )));
    }

    let now = Utc::now();
    let updated = sqlx::query_as::<_, PaymentIntentRow>(
        r#"
        UPDATE payment_intents
        SET status = $1, version = version + 1, updated_at = $2
        WHERE payment_intent_id = $3
        RETURNING payment_intent_id, intent_ref, pledge_id, amount_cents, currency, status,
                  gateway_label, gateway_snapshot, version, created_at, updated_at
        "#,
    )
    .bind(PaymentStatus::Refunded.as_str())
    .bind(now)
    .bind(id)
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
    .bind(PaymentStatus::Captured.as_str())
    .bind(PaymentStatus::Refunded.as_str())
    .bind(updated.version)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let event_payload = PaymentEventPayload {
        payment_intent_id: updated.payment_intent_id,
        pledge_id: updated.pledge_id,
        amount_cents: updated.amount_cents,
        currency: updated.currency.clone(),
        status: updated.status.clone(),
        occurred_at: now,
    };

    don_outbox::enqueue(
        &mut tx,
        &NewOutboxRecord {
            outbox_id: Uuid::new_v4(),
            aggregate_type: "payment_intent".to_string(),
            aggregate_id: updated.payment_intent_id,
            event_type: "PaymentRefunded".to_string(),
            routing_key: "payment.paymentrefunded".to_string(),
            payload: serde_json::to_value(&event_payload).map_err(anyhow::Error::from)?,
            idempotency_key: None,
        },
    )
    .await?;

    tx.commit().await?;

    tracing::info!(payment_intent_id = %id, "payment intent refunded");

    Ok(Json(json!({
        "status": "refunded",
        "payment_intent_id": updated.payment_intent_id,
        "version": updated.version,
    })))
}
