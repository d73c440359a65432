//! Wire/event DTOs shared across services.
//!
//! These types cross process boundaries (HTTP bodies, bus messages) and are
//! intentionally decoupled from any one service's persisted row shape.

use chrono::{DateTime, Utc};
use don_money::Cents;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping every message published to the shared topic bus.
/// Mirrors the outbox payload shape: enough to route, dedup, and decode
/// without a second round-trip to the producing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "usd",
            Currency::Eur => "eur",
            Currency::Gbp => "gbp",
        }
    }
}

impl std::str::FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "usd" => Ok(Currency::Usd),
            "eur" => Ok(Currency::Eur),
            "gbp" => Ok(Currency::Gbp),
            other => Err(format!("unknown currency: {other}")),
        }
    }
}

/// Pledge lifecycle status, shared between `donation-service` and the
/// payload shape other services decode when consuming donation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PledgeStatus {
    Pending,
    Confirmed,
    Failed,
    Refunded,
}

impl PledgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PledgeStatus::Pending => "pending",
            PledgeStatus::Confirmed => "confirmed",
            PledgeStatus::Failed => "failed",
            PledgeStatus::Refunded => "refunded",
        }
    }
}

impl std::str::FromStr for PledgeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PledgeStatus::Pending),
            "confirmed" => Ok(PledgeStatus::Confirmed),
            "failed" => Ok(PledgeStatus::Failed),
            "refunded" => Ok(PledgeStatus::Refunded),
            other => Err(format!("unknown pledge status: {other}")),
        }
    }
}

/// Payload carried on `donations.events` / routing key `donation.<event_type>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonationEventPayload {
    pub pledge_id: Uuid,
    pub campaign_id: Uuid,
    pub donor_email: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub payment_intent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payment intent status, shared between `payment-service` and downstream
/// consumers that react to `PaymentStatus::Captured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Initiated,
    Authorized,
    Captured,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "initiated",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Captured => "captured",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// The fixed transition graph from spec §4.2. Returns `true` if moving
    /// from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Initiated, Authorized)
                | (Initiated, Failed)
                | (Authorized, Captured)
                | (Authorized, Failed)
                | (Authorized, Refunded)
                | (Captured, Refunded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Refunded)
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(PaymentStatus::Initiated),
            "authorized" => Ok(PaymentStatus::Authorized),
            "captured" => Ok(PaymentStatus::Captured),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

/// Payload carried on `payments.events`, consumed by `totals-service` to
/// invalidate campaign aggregate caches on capture. `payment-service` does
/// not own campaign data, so this carries `pledge_id` only; a consumer that
/// needs the owning campaign resolves it itself (`totals-service` looks it
/// up against its own `pledges` mirror the same way the original consumer
/// resolved `donation.campaign_id` from the donation row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEventPayload {
    pub payment_intent_id: Uuid,
    pub pledge_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub occurred_at: DateTime<Utc>,
}

/// Payload carried on `bank.events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEventPayload {
    pub transaction_id: Uuid,
    pub from_account_number: String,
    pub to_account_number: String,
    pub amount_cents: i64,
    pub currency: String,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
}

/// A notification-service work item decoded off the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEventPayload {
    pub pledge_ref: Uuid,
    pub event_kind: String,
    pub recipient_email: String,
    pub amount_cents: i64,
    pub currency: String,
}

/// Helper used by several services when formatting money in API responses.
pub fn cents_to_decimal_string(c: Cents) -> String {
    c.to_string()
}
