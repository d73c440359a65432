use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Response shape for `GET /v1/totals/campaigns/{id}`, shared across all
/// three read tiers so a caller cannot tell which tier answered except via
/// `source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignTotals {
    pub campaign_id: Uuid,
    pub total_donations: i64,
    pub total_cents: i64,
    pub unique_donors: i64,
    pub last_updated: Option<DateTime<Utc>>,
    pub source: String,
    pub cache_age_seconds: f64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct SnapshotRow {
    pub total_donations: i64,
    pub total_cents: i64,
    pub unique_donors: i64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct RealtimeRow {
    pub total_donations: i64,
    pub total_cents: i64,
    pub unique_donors: i64,
    pub last_updated: Option<DateTime<Utc>>,
}
