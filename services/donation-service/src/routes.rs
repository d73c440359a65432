use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use don_cache::donation_key;
use don_outbox::NewOutboxRecord;
use don_schemas::DonationEventPayload;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{CreatePledgeRequest, PledgeResponse, PledgeRow, UpdateStatusRequest};
use crate::state::AppState;

const DONATION_CACHE_TTL: Duration = Duration::from_secs(300);

pub fn build_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/donations", post(create_donation))
        .route("/donations/history", get(donation_history))
        .route("/donations/:id", get(get_donation))
        .route("/donations/:id/status", patch(update_status));

    Router::new()
        .nest("/v1", v1)
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Result<&'static str, ApiError> {
    don_db::ping(&state.pool).await?;
    Ok("ok")
}

async fn create_donation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePledgeRequest>,
) -> Result<Json<PledgeResponse>, ApiError> {
    if req.amount_cents <= 0 {
        return Err(ApiError::Validation("amount_cents must be positive".into()));
    }
    if req.amount_cents > state.settings.max_pledge_cents {
        return Err(ApiError::Validation(format!(
            "amount_cents {} exceeds MAX_PLEDGE {}",
            req.amount_cents, state.settings.max_pledge_cents
        )));
    }
    if req.donor_email.trim().is_empty() {
        return Err(ApiError::Validation("donor_email is required".into()));
    }

    let pledge_id = Uuid::new_v4();
    let mut tx = state.pool.begin().await?;

    let row = sqlx::query_as::<_, PledgeRow>(
        r#"
        INSERT INTO pledges (pledge_id, campaign_id, donor_email, amount_cents, currency, status)
        VALUES ($1, $2, $3, $4, $5, 'pending')
        RETURNING pledge_id, campaign_id, donor_email, amount_cents, currency, status,
                  payment_intent_id, version, created_at, updated_at
        "#,
    )
    .bind(pledge_id)
    .bind(req.campaign_id)
    .bind(&req.donor_email)
    .bind(req.amount_cents)
    .bind(&req.currency)
    .fetch_one(&mut *tx)
    .await?;

    let payload = DonationEventPayload {
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
            event_type: "PledgeCreated".to_string(),
            routing_key: don_bus::routing_key("donation", "PledgeCreated"),
            payload: serde_json::to_value(&payload).map_err(anyhow::Error::from)?,
            idempotency_key: Some(format!("pledge-created:{}", row.pledge_id)),
        },
    )
    .await?;

    tx.commit().await?;

    tracing::info!(pledge_id = %row.pledge_id, "pledge created");

    Ok(Json(row.into()))
}

async fn get_donation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PledgeResponse>, ApiError> {
    let cache_key = donation_key(&id);
    {
        let mut cache = state.cache.lock().await;
        if let Ok(Some(cached)) = cache.get_json::<PledgeResponse>(&cache_key).await {
            return Ok(Json(cached));
        }
    }

    let row = sqlx::query_as::<_, PledgeRow>(
        r#"
        SELECT pledge_id, campaign_id, donor_email, amount_cents, currency, status,
               payment_intent_id, version, created_at, updated_at
        FROM pledges WHERE pledge_id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("pledge {id} not found")))?;

    let response: PledgeResponse = row.into();

    {
        let mut cache = state.cache.lock().await;
        let _ = cache.set_json(&cache_key, &response, DONATION_CACHE_TTL).await;
    }

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub donor_email: String,
}

async fn donation_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<PledgeResponse>>, ApiError> {
    let rows = sqlx::query_as::<_, PledgeRow>(
        r#"
        SELECT pledge_id, campaign_id, donor_email, amount_cents, currency, status,
               payment_intent_id, version, created_at, updated_at
        FROM pledges WHERE donor_email = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(&q.donor_email)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows.into_iter().map(PledgeResponse::from).collect()))
}

/// `status` is terminal once a pledge is confirmed, failed, or refunded
/// (spec §3: "status evolves monotonically ... terminal for a given
/// gateway_intent_ref").
fn is_terminal_pledge_status(status: &str) -> bool {
    matches!(status, "confirmed" | "failed" | "refunded")
}

/// Spec §3's pledge invariant: `status ∈ {PENDING, COMPLETED, FAILED,
/// REFUNDED}` — `confirmed` here is this workspace's lowercase spelling of
/// `COMPLETED` (see the `pledge_mirror`/`campaign_totals` filter in
/// totals-service, which matches on the same value). Any other string would
/// silently corrupt the status column with nothing downstream able to
/// recognize it as terminal or non-terminal.
fn is_known_pledge_status(status: &str) -> bool {
    matches!(status, "pending" | "confirmed" | "failed" | "refunded")
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<PledgeResponse>, ApiError> {
    if !is_known_pledge_status(&req.status) {
        return Err(ApiError::Validation(format!(
            "status must be one of pending, confirmed, failed, refunded, got {}",
            req.status
        )));
    }

    let mut tx = state.pool.begin().await?;

    let current = sqlx::query_as::<_, PledgeRow>(
        r#"
        SELECT pledge_id, campaign_id, donor_email, amount_cents, currency, status,
               payment_intent_id, version, created_at, updated_at
        FROM pledges WHERE pledge_id = $1
        FOR UPDATE
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("pledge {id} not found")))?;

    if is_terminal_pledge_status(&current.status) {
        return Err(ApiError::Validation(format!(
            "pledge {id} is already {} and cannot change status",
            current.status
        )));
    }

    let row = sqlx::query_as::<_, PledgeRow>(
        r#"
        UPDATE pledges
        SET status = $1, payment_intent_id = COALESCE($2, payment_intent_id),
            version = version + 1, updated_at = now()
        WHERE pledge_id = $3
        RETURNING pledge_id, campaign_id, donor_email, amount_cents, currency, status,
                  payment_intent_id, version, created_at, updated_at
        "#,
    )
    .bind(&req.status)
    .bind(req.payment_intent_id)
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("pledge {id} not found")))?;

    let payload = DonationEventPayload {
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
            payload: serde_json::to_value(&payload).map_err(anyhow::Error::from)?,
            idempotency_key: None,
        },
    )
    .await?;

    tx.commit().await?;

    {
        let mut cache = state.cache.lock().await;
        let _ = cache.invalidate(&donation_key(&id)).await;
    }

    tracing::info!(pledge_id = %id, status = %row.status, "pledge status updated");

    Ok(Json(row.into()))
}
