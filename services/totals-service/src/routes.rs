//! Three-tier campaign totals read path (spec §4.4).
//!
//! T1 (hot cache, 30s TTL) → T2 (pre-aggregated `campaign_totals` materialized
//! view) → T3 (authoritative recount over `pledges`). `?realtime=true` skips
//! straight to T3, which is always available as an escape hatch for exact
//! totals.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use don_cache::campaign_totals_key;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{CampaignTotals, RealtimeRow, SnapshotRow};
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new().route("/totals/campaigns/:id", get(get_totals));

    Router::new()
        .nest("/v1", v1)
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Result<&'static str, ApiError> {
    don_db::ping(&state.pool).await?;
    Ok("ok")
}

#[derive(Debug, Deserialize)]
pub struct TotalsQuery {
    #[serde(default)]
    pub realtime: bool,
}

async fn get_totals(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
    Query(q): Query<TotalsQuery>,
) -> Result<Json<CampaignTotals>, ApiError> {
    if q.realtime {
        let row = recount(&state, campaign_id).await?;
        return Ok(Json(row));
    }

    let cache_key = campaign_totals_key(&campaign_id);
    {
        let mut cache = state.cache.lock().await;
        if let Ok(Some(mut cached)) = cache.get_json::<CampaignTotals>(&cache_key).await {
            cached.source = "hot".to_string();
            cached.cache_age_seconds = age_seconds(cached.last_updated);
            return Ok(Json(cached));
        }
    }

    if let Some(snapshot) = snapshot(&state, campaign_id).await? {
        let mut response = snapshot;
        response.source = "snapshot".to_string();
        warm_hot_cache(&state, &cache_key, &response).await;
        return Ok(Json(response));
    }

    let response = recount(&state, campaign_id).await?;
    warm_hot_cache(&state, &cache_key, &response).await;
    Ok(Json(response))
}

async fn snapshot(state: &AppState, campaign_id: Uuid) -> Result<Option<CampaignTotals>, ApiError> {
    let row = sqlx::query_as::<_, SnapshotRow>(
        r#"
        SELECT total_donations, total_cents, unique_donors, last_updated
        FROM campaign_totals WHERE campaign_id = $1
        "#,
    )
    .bind(campaign_id)
    .fetch_optional(&state.pool)
    .await?;

    Ok(row.map(|r| CampaignTotals {
        campaign_id,
        total_donations: r.total_donations,
        total_cents: r.total_cents,
        unique_donors: r.unique_donors,
        last_updated: r.last_updated,
        source: "snapshot".to_string(),
        cache_age_seconds: age_seconds(r.last_updated),
    }))
}

async fn recount(state: &AppState, campaign_id: Uuid) -> Result<CampaignTotals, ApiError> {
    let row = sqlx::query_as::<_, RealtimeRow>(
        r#"
        SELECT
            count(*)                        AS total_donations,
            coalesce(sum(amount_cents), 0)  AS total_cents,
            count(DISTINCT donor_email)     AS unique_donors,
            max(updated_at)                 AS last_updated
        FROM pledge_mirror
        WHERE campaign_id = $1 AND status = 'confirmed'
        "#,
    )
    .bind(campaign_id)
    .fetch_one(&state.pool)
    .await?;

    Ok(CampaignTotals {
        campaign_id,
        total_donations: row.total_donations,
        total_cents: row.total_cents,
        unique_donors: row.unique_donors,
        last_updated: row.last_updated,
        source: "authoritative".to_string(),
        cache_age_seconds: age_seconds(row.last_updated),
    })
}

fn age_seconds(last_updated: Option<chrono::DateTime<Utc>>) -> f64 {
    match last_updated {
        Some(ts) => (Utc::now() - ts).num_milliseconds().max(0) as f64 / 1000.0,
        None => 0.0,
    }
}

async fn warm_hot_cache(state: &AppState, cache_key: &str, response: &CampaignTotals) {
    let mut cache = state.cache.lock().await;
    if let Err(err) = cache
        .set_json(cache_key, response, state.settings.totals_cache_ttl)
        .await
    {
        tracing::warn!(error = %err, "failed to warm T1 totals cache, degrading to read-through next request");
    }
}
