use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Local mirror row populated from `donation.pledgecreated`, used to resolve
/// a recipient email for a later `PaymentStatus.Captured` event — the
/// payment event itself does not carry contact details (spec §3
/// "Ownership": cross-service references are by opaque id only).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PledgeContactRow {
    pub pledge_id: Uuid,
    pub campaign_id: Uuid,
    pub donor_email: String,
    pub amount_cents: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// A sent-notification row, unique on `(pledge_ref, event_kind)` per the
/// spec's Open Questions section so duplicate bus deliveries cannot cause
/// two emails for the same logical event.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotificationRow {
    pub notification_id: Uuid,
    pub pledge_ref: Uuid,
    pub event_kind: String,
    pub recipient_email: String,
    pub template_id: String,
    pub status: String,
    pub sent_at: Option<DateTime<Utc>>,
}
