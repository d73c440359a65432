//! End-to-end scenarios 2-4 from spec §8: idempotent webhook replay,
//! invalid transition rejection, and out-of-order rejection.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use don_idempotency::IdempotencyGuard;
use uuid::Uuid;

async fn migrated_pool() -> sqlx::PgPool {
    let pool = don_testkit::testkit_db_pool()
        .await
        .expect("test database pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    pool
}

async fn guard() -> IdempotencyGuard {
    let url = std::env::var("CACHE_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    IdempotencyGuard::connect(&url, Duration::from_secs(86_400))
        .await
        .expect("connect redis for test")
}

async fn insert_intent(pool: &sqlx::PgPool, status: &str) -> (Uuid, String) {
    let id = Uuid::new_v4();
    let intent_ref = format!("pi_{}", Uuid::new_v4().simple());
    sqlx::query(
        "INSERT INTO payment_intents (payment_intent_id, intent_ref, pledge_id, amount_cents, currency, status) \
         VALUES ($1, $2, $3, 5000, 'usd', $4)",
    )
    .bind(id)
    .bind(&intent_ref)
    .bind(Uuid::new_v4())
    .bind(status)
    .execute(pool)
    .await
    .unwrap();
    (id, intent_ref)
}

use payment_service::models::WebhookPayload;
use payment_service::webhook;

#[tokio::test]
async fn duplicate_webhook_delivery_replays_cached_response_and_applies_once() {
    let pool = migrated_pool().await;
    let mut idem = guard().await;

    let (intent_id, intent_ref) = insert_intent(&pool, "initiated").await;
    let key = Uuid::new_v4().to_string();
    let payload = WebhookPayload {
        intent_ref,
        new_status: "authorized".to_string(),
        event_timestamp: Utc::now(),
        payload: None,
    };
    let body = serde_json::to_vec(&payload).unwrap();

    let first = webhook::process_webhook(&pool, &mut idem, Some(&key), &body, payload.clone())
        .await
        .expect("first delivery processes");
    assert_eq!(first.status, 200);
    assert_eq!(first.body["status"], "processed");
    assert_eq!(first.body["version"], 1);

    let second = webhook::process_webhook(&pool, &mut idem, Some(&key), &body, payload)
        .await
        .expect("second delivery replays");
    assert_eq!(second.body, first.body);

    let version: i32 = sqlx::query_scalar("SELECT version FROM payment_intents WHERE payment_intent_id = $1")
        .bind(intent_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(version, 1, "replayed delivery must not re-apply the transition");

    let transitions: i64 =
        sqlx::query_scalar("SELECT count(*) FROM payment_transitions WHERE payment_intent_id = $1")
            .bind(intent_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(transitions, 1);
}

#[tokio::test]
async fn invalid_transition_is_rejected_and_state_is_unchanged() {
    let pool = migrated_pool().await;
    let mut idem = guard().await;

    let (intent_id, intent_ref) = insert_intent(&pool, "initiated").await;
    let payload = WebhookPayload {
        intent_ref,
        new_status: "captured".to_string(),
        event_timestamp: Utc::now(),
        payload: None,
    };
    let body = serde_json::to_vec(&payload).unwrap();

    let result = webhook::process_webhook(&pool, &mut idem, None, &body, payload)
        .await
        .unwrap();

    assert_eq!(result.status, 400);
    assert_eq!(result.body["reason"], "invalid_transition");

    let status: String = sqlx::query_scalar("SELECT status FROM payment_intents WHERE payment_intent_id = $1")
        .bind(intent_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "initiated");
}

#[tokio::test]
async fn out_of_order_event_is_ignored() {
    let pool = migrated_pool().await;
    let mut idem = guard().await;

    let (intent_id, intent_ref) = insert_intent(&pool, "initiated").await;
    let now = Utc::now();

    // Move the intent forward once so updated_at advances past `now`.
    let advance_payload = WebhookPayload {
        intent_ref: intent_ref.clone(),
        new_status: "authorized".to_string(),
        event_timestamp: now,
        payload: None,
    };
    let advance_body = serde_json::to_vec(&advance_payload).unwrap();
    webhook::process_webhook(&pool, &mut idem, None, &advance_body, advance_payload)
        .await
        .unwrap();

    let stale_payload = WebhookPayload {
        intent_ref,
        new_status: "failed".to_string(),
        event_timestamp: now - ChronoDuration::seconds(5),
        payload: None,
    };
    let stale_body = serde_json::to_vec(&stale_payload).unwrap();
    let result = webhook::process_webhook(&pool, &mut idem, None, &stale_body, stale_payload)
        .await
        .unwrap();

    assert_eq!(result.status, 200);
    assert_eq!(result.body["status"], "ignored");
    assert_eq!(result.body["reason"], "out_of_order");

    let status: String = sqlx::query_scalar("SELECT status FROM payment_intents WHERE payment_intent_id = $1")
        .bind(intent_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "authorized");
}
