use chrono::{DateTime, Utc};
use don_money::Cents;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PledgeRow {
    pub pledge_id: Uuid,
    pub campaign_id: Uuid,
    pub donor_email: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub payment_intent_id: Option<Uuid>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PledgeResponse {
    pub pledge_id: Uuid,
    pub campaign_id: Uuid,
    pub donor_email: String,
    pub amount: String,
    pub currency: String,
    pub status: String,
    pub payment_intent_id: Option<Uuid>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PledgeRow> for PledgeResponse {
    fn from(row: PledgeRow) -> Self {
        PledgeResponse {
            pledge_id: row.pledge_id,
            campaign_id: row.campaign_id,
            donor_email: row.donor_email,
            amount: Cents::new(row.amount_cents).to_string(),
            currency: row.currency,
            status: row.status,
            payment_intent_id: row.payment_intent_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePledgeRequest {
    pub campaign_id: Uuid,
    pub donor_email: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    pub payment_intent_id: Option<Uuid>,
}
