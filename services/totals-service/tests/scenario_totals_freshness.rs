//! End-to-end scenario 6 from spec §8: totals freshness across tiers.
//!
//! totals-service owns its own `pledge_mirror` table (spec §3 Ownership:
//! never shared storage), populated the same way production traffic
//! populates it -- by feeding `donation.pledgecreated`/
//! `donation.pledgestatuschanged` payloads through `consumer::upsert_mirror`
//! -- rather than by inserting into donation-service's schema directly.

use chrono::Utc;
use don_schemas::DonationEventPayload;
use totals_service::consumer;
use uuid::Uuid;

async fn migrated_pool() -> sqlx::PgPool {
    let pool = don_testkit::testkit_db_pool()
        .await
        .expect("test database pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run totals-service migrations");
    pool
}

fn confirmed_pledge_payload(campaign_id: Uuid, amount_cents: i64, donor: &str) -> DonationEventPayload {
    let now = Utc::now();
    DonationEventPayload {
        pledge_id: Uuid::new_v4(),
        campaign_id,
        donor_email: donor.to_string(),
        amount_cents,
        currency: "usd".to_string(),
        status: "confirmed".to_string(),
        payment_intent_id: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn authoritative_recount_reflects_only_confirmed_donations_for_the_campaign() {
    let pool = migrated_pool().await;
    let campaign_id = Uuid::new_v4();
    let other_campaign = Uuid::new_v4();

    consumer::upsert_mirror(&pool, &confirmed_pledge_payload(campaign_id, 5_000, "a@example.test"))
        .await
        .unwrap();
    consumer::upsert_mirror(&pool, &confirmed_pledge_payload(campaign_id, 7_500, "b@example.test"))
        .await
        .unwrap();
    consumer::upsert_mirror(&pool, &confirmed_pledge_payload(other_campaign, 1_000, "c@example.test"))
        .await
        .unwrap();

    let mut pending = confirmed_pledge_payload(campaign_id, 9_999, "d@example.test");
    pending.status = "pending".to_string();
    consumer::upsert_mirror(&pool, &pending).await.unwrap();

    let row: (i64, i64, i64) = sqlx::query_as(
        "SELECT count(*), coalesce(sum(amount_cents), 0), count(DISTINCT donor_email) \
         FROM pledge_mirror WHERE campaign_id = $1 AND status = 'confirmed'",
    )
    .bind(campaign_id)
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(row.0, 2, "pending pledge must not count toward totals");
    assert_eq!(row.1, 12_500);
    assert_eq!(row.2, 2);
}

#[tokio::test]
async fn snapshot_view_matches_authoritative_recount_after_refresh() {
    let pool = migrated_pool().await;
    let campaign_id = Uuid::new_v4();

    consumer::upsert_mirror(&pool, &confirmed_pledge_payload(campaign_id, 5_000, "a@example.test"))
        .await
        .unwrap();
    consumer::upsert_mirror(&pool, &confirmed_pledge_payload(campaign_id, 2_500, "b@example.test"))
        .await
        .unwrap();

    sqlx::query("REFRESH MATERIALIZED VIEW campaign_totals")
        .execute(&pool)
        .await
        .unwrap();

    let row: (i64, i64, i64) = sqlx::query_as(
        "SELECT total_donations, total_cents, unique_donors FROM campaign_totals WHERE campaign_id = $1",
    )
    .bind(campaign_id)
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(row, (2, 7_500, 2));
}

#[tokio::test]
async fn mirror_upsert_ignores_stale_redelivery_out_of_order() {
    let pool = migrated_pool().await;
    let mut payload = confirmed_pledge_payload(Uuid::new_v4(), 5_000, "a@example.test");

    consumer::upsert_mirror(&pool, &payload).await.unwrap();

    // A redelivery carrying an older `updated_at` than what's already
    // mirrored (e.g. a retried `pledgecreated` arriving after a newer
    // `pledgestatuschanged` already landed) must not roll the status back.
    let newer_updated_at = payload.updated_at + chrono::Duration::seconds(5);
    let mut newer = payload.clone();
    newer.status = "confirmed".to_string();
    newer.updated_at = newer_updated_at;
    consumer::upsert_mirror(&pool, &newer).await.unwrap();

    payload.status = "pending".to_string();
    consumer::upsert_mirror(&pool, &payload).await.unwrap();

    let status: String =
        sqlx::query_scalar("SELECT status FROM pledge_mirror WHERE pledge_id = $1")
            .bind(payload.pledge_id)
            .fetch_one(&pool)
            .await
            .unwrap();

    assert_eq!(status, "confirmed", "stale redelivery must not overwrite a newer mirrored status");
}
