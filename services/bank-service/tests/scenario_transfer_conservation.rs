//! End-to-end scenario 5 from spec §8: transfer conservation, idempotent
//! retry, and reversal round-trip.

use don_ledger::{execute_transfer, reverse_transfer, LedgerDomainError, TransferError, TransferRequest};
use don_money::Cents;
use uuid::Uuid;

const MAX_TRANSFER: Cents = Cents::new(1_000_000_00);

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

async fn open_account(pool: &sqlx::PgPool, balance_cents: i64) -> String {
    let account_number = don_testkit::unique_account_number();
    sqlx::query(
        r#"
        INSERT INTO accounts (account_id, owner_ref, account_number, holder_name, contact, balance_cents, currency, status)
        VALUES ($1, $2, $3, 'Test Holder', 'test@example.test', $4, 'usd', 'active')
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(Uuid::new_v4())
    .bind(&account_number)
    .bind(balance_cents)
    .execute(pool)
    .await
    .unwrap();
    account_number
}

async fn balance_of(pool: &sqlx::PgPool, account_number: &str) -> i64 {
    sqlx::query_scalar("SELECT balance_cents FROM accounts WHERE account_number = $1")
        .bind(account_number)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn transfer_conserves_value_and_duplicate_key_does_not_re_apply() {
    let pool = migrated_pool().await;

    let a = open_account(&pool, 50_000).await;
    let b = open_account(&pool, 10_000).await;
    let key = don_testkit::unique_idempotency_key();

    let first = execute_transfer(
        &pool,
        &TransferRequest {
            idempotency_key: key.clone(),
            from_account_number: a.clone(),
            to_account_number: b.clone(),
            amount: Cents::new(7_500),
            currency: "usd".to_string(),
            max_transfer: MAX_TRANSFER,
        },
    )
    .await
    .expect("transfer succeeds");

    assert!(first.newly_executed);
    assert_eq!(balance_of(&pool, &a).await, 42_500);
    assert_eq!(balance_of(&pool, &b).await, 17_500);

    let retried = execute_transfer(
        &pool,
        &TransferRequest {
            idempotency_key: key,
            from_account_number: a.clone(),
            to_account_number: b.clone(),
            amount: Cents::new(7_500),
            currency: "usd".to_string(),
            max_transfer: MAX_TRANSFER,
        },
    )
    .await
    .expect("duplicate key returns cached outcome");

    assert!(!retried.newly_executed);
    assert_eq!(retried.transaction_id, first.transaction_id);
    assert_eq!(balance_of(&pool, &a).await, 42_500, "balances must not move a second time");
    assert_eq!(balance_of(&pool, &b).await, 17_500);

    let entry_count: i64 = sqlx::query_scalar("SELECT count(*) FROM transactions WHERE idempotency_key IS NOT NULL AND from_account_id = (SELECT account_id FROM accounts WHERE account_number = $1)")
        .bind(&a)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(entry_count, 1);
}

#[tokio::test]
async fn reversal_returns_balances_to_pre_transfer_values() {
    let pool = migrated_pool().await;

    let a = open_account(&pool, 50_000).await;
    let b = open_account(&pool, 10_000).await;

    let transfer = execute_transfer(
        &pool,
        &TransferRequest {
            idempotency_key: don_testkit::unique_idempotency_key(),
            from_account_number: a.clone(),
            to_account_number: b.clone(),
            amount: Cents::new(7_500),
            currency: "usd".to_string(),
            max_transfer: MAX_TRANSFER,
        },
    )
    .await
    .unwrap();

    assert_eq!(balance_of(&pool, &a).await, 42_500);
    assert_eq!(balance_of(&pool, &b).await, 17_500);

    reverse_transfer(&pool, transfer.transaction_id, &don_testkit::unique_idempotency_key(), MAX_TRANSFER)
        .await
        .expect("reversal succeeds");

    assert_eq!(balance_of(&pool, &a).await, 50_000, "A returns to pre-transfer balance");
    assert_eq!(balance_of(&pool, &b).await, 10_000, "B returns to pre-transfer balance");

    let again = reverse_transfer(&pool, transfer.transaction_id, &don_testkit::unique_idempotency_key(), MAX_TRANSFER).await;
    match again {
        Err(TransferError::Domain(LedgerDomainError::AlreadyReversed { transaction_id })) => {
            assert_eq!(transaction_id, transfer.transaction_id);
        }
        other => panic!("expected AlreadyReversed, got {other:?}"),
    }
}

#[tokio::test]
async fn reversal_of_a_reversal_is_rejected() {
    let pool = migrated_pool().await;

    let a = open_account(&pool, 50_000).await;
    let b = open_account(&pool, 10_000).await;

    let transfer = execute_transfer(
        &pool,
        &TransferRequest {
            idempotency_key: don_testkit::unique_idempotency_key(),
            from_account_number: a,
            to_account_number: b,
            amount: Cents::new(7_500),
            currency: "usd".to_string(),
            max_transfer: MAX_TRANSFER,
        },
    )
    .await
    .unwrap();

    let reversal = reverse_transfer(&pool, transfer.transaction_id, &don_testkit::unique_idempotency_key(), MAX_TRANSFER)
        .await
        .expect("reversal succeeds");

    // A reversal is itself a fresh transfer and is not transitively
    // reversible (spec §4.3).
    let second = reverse_transfer(&pool, reversal.transaction_id, &don_testkit::unique_idempotency_key(), MAX_TRANSFER).await;
    match second {
        Err(TransferError::Domain(LedgerDomainError::NotReversible { transaction_id, kind })) => {
            assert_eq!(transaction_id, reversal.transaction_id);
            assert_eq!(kind, "reversal");
        }
        other => panic!("expected NotReversible, got {other:?}"),
    }
}

#[tokio::test]
async fn same_account_transfer_is_rejected() {
    let pool = migrated_pool().await;
    let a = open_account(&pool, 50_000).await;

    let result = execute_transfer(
        &pool,
        &TransferRequest {
            idempotency_key: don_testkit::unique_idempotency_key(),
            from_account_number: a.clone(),
            to_account_number: a.clone(),
            amount: Cents::new(100),
            currency: "usd".to_string(),
            max_transfer: MAX_TRANSFER,
        },
    )
    .await;

    match result {
        Err(TransferError::Domain(LedgerDomainError::SameAccount { .. })) => {}
        other => panic!("expected SameAccount rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_opposite_transfers_both_complete_and_preserve_total() {
    let pool = migrated_pool().await;
    let a = open_account(&pool, 500).await;
    let b = open_account(&pool, 500).await;

    let pool_a = pool.clone();
    let pool_b = pool.clone();
    let (a1, b1) = (a.clone(), b.clone());
    let (a2, b2) = (a.clone(), b.clone());

    let (r1, r2) = tokio::join!(
        execute_transfer(
            &pool_a,
            &TransferRequest {
                idempotency_key: don_testkit::unique_idempotency_key(),
                from_account_number: a1,
                to_account_number: b1,
                amount: Cents::new(100),
                currency: "usd".to_string(),
                max_transfer: MAX_TRANSFER,
            },
        ),
        execute_transfer(
            &pool_b,
            &TransferRequest {
                idempotency_key: don_testkit::unique_idempotency_key(),
                from_account_number: b2,
                to_account_number: a2,
                amount: Cents::new(100),
                currency: "usd".to_string(),
                max_transfer: MAX_TRANSFER,
            },
        ),
    );

    r1.expect("A to B completes");
    r2.expect("B to A completes");

    assert_eq!(balance_of(&pool, &a).await, 500);
    assert_eq!(balance_of(&pool, &b).await, 500);
}
