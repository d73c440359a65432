use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentIntentRow {
    pub payment_intent_id: Uuid,
    pub intent_ref: String,
    pub pledge_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub gateway_label: String,
    pub gateway_snapshot: Option<serde_json::Value>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PaymentIntentResponse {
    pub payment_intent_id: Uuid,
    pub intent_ref: String,
    pub pledge_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub version: i32,
}

impl From<PaymentIntentRow> for PaymentIntentResponse {
    fn from(row: PaymentIntentRow) -> Self {
        PaymentIntentResponse {
            payment_intent_id: row.payment_intent_id,
            intent_ref: row.intent_ref,
            pledge_id: row.pledge_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: row.status,
            version: row.version,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentIntentRequest {
    pub pledge_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    #[serde(default)]
    pub gateway_label: Option<String>,
}

/// Shape of an inbound webhook body. The original payment processor's
/// webhook format is vendor-specific; this is the normalized shape the
/// HTTP layer decodes it into before handing off to the state machine.
/// `intent_ref` is the gateway's own opaque charge/intent identifier — a
/// real gateway never learns this service's internal `payment_intent_id`
/// primary key, so webhook lookups must go through `intent_ref` instead.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookPayload {
    pub intent_ref: String,
    pub new_status: String,
    pub event_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    #[serde(default)]
    pub reason: Option<String>,
}
