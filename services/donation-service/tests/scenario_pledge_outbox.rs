//! Creating a pledge must write the pledge row and an outbox row in the same
//! transaction, and the outbox pipeline must drain it exactly once.

use chrono::Utc;
use don_schemas::PaymentEventPayload;
use donation_service::consumer::confirm_pledge;
use tokio::sync::Mutex;
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

#[tokio::test]
async fn pledge_insert_and_outbox_enqueue_are_atomic() {
    let pool = migrated_pool().await;

    let pledge_id = Uuid::new_v4();
    let campaign_id = Uuid::new_v4();
    let donor_email = don_testkit::unique_email("donor");

    let mut tx = pool.begin().await.unwrap();

    sqlx::query(
        "INSERT INTO pledges (pledge_id, campaign_id, donor_email, amount_cents, currency, status) \
         VALUES ($1, $2, $3, $4, 'usd', 'pending')",
    )
    .bind(pledge_id)
    .bind(campaign_id)
    .bind(&donor_email)
    .bind(2500_i64)
    .execute(&mut *tx)
    .await
    .unwrap();

    let enqueued = don_outbox::enqueue(
        &mut tx,
        &don_outbox::NewOutboxRecord {
            outbox_id: Uuid::new_v4(),
            aggregate_type: "pledge".into(),
            aggregate_id: pledge_id,
            event_type: "PledgeCreated".into(),
            routing_key: "donation.pledgecreated".into(),
            payload: serde_json::json!({ "pledge_id": pledge_id }),
            idempotency_key: Some(format!("pledge-created:{pledge_id}")),
        },
    )
    .await
    .unwrap();
    assert!(enqueued);

    tx.commit().await.unwrap();

    let pending: i64 = sqlx::query_scalar("SELECT count(*) FROM outbox WHERE status = 'pending'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn claim_batch_skips_rows_claimed_by_another_poller() {
    let pool = migrated_pool().await;

    let outbox_id = Uuid::new_v4();
    let mut tx = pool.begin().await.unwrap();
    don_outbox::enqueue(
        &mut tx,
        &don_outbox::NewOutboxRecord {
            outbox_id,
            aggregate_type: "pledge".into(),
            aggregate_id: Uuid::new_v4(),
            event_type: "PledgeCreated".into(),
            routing_key: "donation.pledgecreated".into(),
            payload: serde_json::json!({}),
            idempotency_key: None,
        },
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let first_claim = don_outbox::claim_batch(&pool, 10).await.unwrap();
    assert_eq!(first_claim.len(), 1);

    // Already claimed: a second claim_batch call must not see it again.
    let second_claim = don_outbox::claim_batch(&pool, 10).await.unwrap();
    assert!(second_claim.is_empty());

    let marked = don_outbox::mark_sent(&pool, outbox_id).await.unwrap();
    assert!(marked);

    let marked_again = don_outbox::mark_sent(&pool, outbox_id).await.unwrap();
    assert!(!marked_again);
}

#[tokio::test]
async fn mark_failed_poisons_after_max_retries() {
    let pool = migrated_pool().await;

    let outbox_id = Uuid::new_v4();
    let mut tx = pool.begin().await.unwrap();
    don_outbox::enqueue(
        &mut tx,
        &don_outbox::NewOutboxRecord {
            outbox_id,
            aggregate_type: "pledge".into(),
            aggregate_id: Uuid::new_v4(),
            event_type: "PledgeCreated".into(),
            routing_key: "donation.pledgecreated".into(),
            payload: serde_json::json!({}),
            idempotency_key: None,
        },
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    don_outbox::claim_batch(&pool, 10).await.unwrap();

    let mut status = don_outbox::mark_failed(&pool, outbox_id, 3).await.unwrap();
    assert_eq!(status, "pending");
    don_outbox::claim_batch(&pool, 10).await.unwrap();
    status = don_outbox::mark_failed(&pool, outbox_id, 3).await.unwrap();
    assert_eq!(status, "pending");
    don_outbox::claim_batch(&pool, 10).await.unwrap();
    status = don_outbox::mark_failed(&pool, outbox_id, 3).await.unwrap();
    assert_eq!(status, "poisoned");
}

/// Spec §3: "status evolves monotonically (COMPLETED/FAILED/REFUNDED are
/// terminal for a given gateway_intent_ref)". A capture event arriving for
/// a pledge that has already moved to a terminal status (here, `failed`,
/// reached out-of-band) must not resurrect it to `confirmed`.
#[tokio::test]
async fn confirm_pledge_does_not_override_a_terminal_status() {
    let pool = migrated_pool().await;
    let cache = std::sync::Arc::new(Mutex::new(
        don_testkit::testkit_cache_client()
            .await
            .expect("test cache client"),
    ));

    let pledge_id = Uuid::new_v4();
    let campaign_id = Uuid::new_v4();
    let donor_email = don_testkit::unique_email("donor");

    sqlx::query(
        "INSERT INTO pledges (pledge_id, campaign_id, donor_email, amount_cents, currency, status) \
         VALUES ($1, $2, $3, 5000, 'usd', 'failed')",
    )
    .bind(pledge_id)
    .bind(campaign_id)
    .bind(&donor_email)
    .execute(&pool)
    .await
    .unwrap();

    let payload = PaymentEventPayload {
        payment_intent_id: Uuid::new_v4(),
        pledge_id,
        amount_cents: 5000,
        currency: "usd".to_string(),
        status: "captured".to_string(),
        occurred_at: Utc::now(),
    };

    confirm_pledge(&pool, &cache, &payload).await.unwrap();

    let status: String = sqlx::query_scalar("SELECT status FROM pledges WHERE pledge_id = $1")
        .bind(pledge_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "failed", "a terminal pledge status must never be overwritten");

    let outbox_count: i64 = sqlx::query_scalar("SELECT count(*) FROM outbox WHERE aggregate_id = $1")
        .bind(pledge_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(outbox_count, 0, "no spurious PledgeStatusChanged event for a no-op confirm");
}
