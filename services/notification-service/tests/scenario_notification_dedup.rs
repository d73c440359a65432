//! Notification dedup per spec's Open Questions section: a uniqueness
//! constraint on `(pledge_ref, event_kind)` must stop duplicate bus
//! deliveries from sending two emails for the same logical event.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use don_schemas::{DonationEventPayload, PaymentEventPayload};
use notification_service::consumer::{mirror_contact, notify_capture};
use notification_service::notifier::Notifier;
use serde_json::Value;
use uuid::Uuid;

async fn migrated_pool() -> sqlx::PgPool {
    let pool = don_testkit::testkit_db_pool()
        .await
        .expect("test database pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run notification-service migrations");
    pool
}

struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn new() -> Self {
        Self { sent: Mutex::new(Vec::new()) }
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: &str, _template_id: &str, _data: &Value) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(recipient.to_string());
        Ok(())
    }
}

/// Fails its first `fail_count` calls, then succeeds — stands in for a
/// notifier that is briefly down when the first delivery attempt arrives.
struct FlakyNotifier {
    remaining_failures: Mutex<u32>,
    sent: Mutex<Vec<String>>,
}

impl FlakyNotifier {
    fn new(fail_count: u32) -> Self {
        Self {
            remaining_failures: Mutex::new(fail_count),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for FlakyNotifier {
    async fn send(&self, recipient: &str, _template_id: &str, _data: &Value) -> anyhow::Result<()> {
        let mut remaining = self.remaining_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            anyhow::bail!("notifier temporarily unavailable");
        }
        drop(remaining);
        self.sent.lock().unwrap().push(recipient.to_string());
        Ok(())
    }
}

fn pledge_created(pledge_id: Uuid, campaign_id: Uuid) -> DonationEventPayload {
    DonationEventPayload {
        pledge_id,
        campaign_id,
        donor_email: don_testkit::unique_email("donor"),
        amount_cents: 5_000,
        currency: "usd".to_string(),
        status: "pending".to_string(),
        payment_intent_id: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn payment_captured(pledge_id: Uuid) -> PaymentEventPayload {
    PaymentEventPayload {
        payment_intent_id: Uuid::new_v4(),
        pledge_id,
        amount_cents: 5_000,
        currency: "usd".to_string(),
        status: "captured".to_string(),
        occurred_at: Utc::now(),
    }
}

#[tokio::test]
async fn repeated_capture_delivery_sends_exactly_one_notification() {
    let pool = migrated_pool().await;
    let notifier = RecordingNotifier::new();

    let pledge_id = Uuid::new_v4();
    let campaign_id = Uuid::new_v4();
    mirror_contact(&pool, &pledge_created(pledge_id, campaign_id))
        .await
        .expect("mirror contact");

    let captured = payment_captured(pledge_id);

    notify_capture(&pool, &notifier, &captured).await.expect("first delivery");
    notify_capture(&pool, &notifier, &captured).await.expect("duplicate delivery");
    notify_capture(&pool, &notifier, &captured).await.expect("triplicate delivery");

    assert_eq!(notifier.count(), 1, "duplicate bus deliveries must not resend");

    let rows: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM notifications WHERE pledge_ref = $1 AND event_kind = 'PaymentStatus.Captured'",
    )
    .bind(pledge_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn failed_send_is_retried_on_redelivery_instead_of_silently_skipped() {
    let pool = migrated_pool().await;
    let notifier = FlakyNotifier::new(1);

    let pledge_id = Uuid::new_v4();
    let campaign_id = Uuid::new_v4();
    mirror_contact(&pool, &pledge_created(pledge_id, campaign_id))
        .await
        .expect("mirror contact");

    let captured = payment_captured(pledge_id);

    let first = notify_capture(&pool, &notifier, &captured).await;
    assert!(first.is_err(), "notifier failure must propagate so the consumer requeues");
    assert_eq!(notifier.count(), 0);

    let status: String = sqlx::query_scalar(
        "SELECT status FROM notifications WHERE pledge_ref = $1 AND event_kind = 'PaymentStatus.Captured'",
    )
    .bind(pledge_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "pending", "claimed-but-undelivered row must stay pending, not sent");

    notify_capture(&pool, &notifier, &captured)
        .await
        .expect("redelivery after notifier recovers must succeed");
    assert_eq!(notifier.count(), 1, "redelivery must actually send once the claim row is still pending");

    let rows: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM notifications WHERE pledge_ref = $1 AND event_kind = 'PaymentStatus.Captured'",
    )
    .bind(pledge_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(rows, 1, "retry must reuse the claimed row, not insert a second one");
}

#[tokio::test]
async fn capture_event_before_contact_mirror_is_transient_and_retryable() {
    let pool = migrated_pool().await;
    let notifier = RecordingNotifier::new();

    let pledge_id = Uuid::new_v4();
    let captured = payment_captured(pledge_id);

    let result = notify_capture(&pool, &notifier, &captured).await;
    assert!(result.is_err(), "no contact mirror yet, handler must fail so the consumer requeues");
    assert_eq!(notifier.count(), 0);
}

#[tokio::test]
async fn mirror_contact_insert_is_idempotent_on_repeat_pledge_created() {
    let pool = migrated_pool().await;
    let pledge_id = Uuid::new_v4();
    let campaign_id = Uuid::new_v4();
    let payload = pledge_created(pledge_id, campaign_id);

    mirror_contact(&pool, &payload).await.expect("first insert");
    mirror_contact(&pool, &payload).await.expect("repeat insert must be a no-op");

    let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM pledge_contacts WHERE pledge_id = $1")
        .bind(pledge_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}
