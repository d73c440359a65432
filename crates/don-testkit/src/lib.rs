//! Test-only fixtures shared across `tests/scenario_*.rs` in every service.
//!
//! Migrations are embedded per-service (`sqlx::migrate!` resolves relative
//! to the invoking crate), so this crate cannot run them generically; each
//! service's own `tests/` helper module calls `sqlx::migrate!("./migrations")`
//! itself and then hands the pool to the fixture builders here.

use anyhow::{Context, Result};
use don_cache::CacheClient;
use sqlx::PgPool;
use uuid::Uuid;

/// Connects to `TEST_DATABASE_URL` (falls back to `DATABASE_URL`). Intended
/// to be called once per test, against a database already migrated by the
/// calling crate.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let url = std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .context("neither TEST_DATABASE_URL nor DATABASE_URL set for tests")?;
    don_db::connect_for_test(&url).await
}

/// Connects to `TEST_CACHE_URL` (falls back to `CACHE_URL`, then the same
/// local default `don_config::Settings` uses). Scenario tests that exercise
/// cache invalidation alongside a handler share this one connection helper
/// rather than each hand-rolling a `redis::Client::open`.
pub async fn testkit_cache_client() -> Result<CacheClient> {
    let url = std::env::var("TEST_CACHE_URL")
        .or_else(|_| std::env::var("CACHE_URL"))
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    CacheClient::connect(&url).await
}

/// Deterministic-looking but unique donor email for fixture rows.
pub fn unique_email(prefix: &str) -> String {
    format!("{prefix}+{}@example.test", Uuid::new_v4())
}

/// Unique account number for fixture rows, formatted like the production
/// generator (`ACC-XXXXXXXX`) so tests exercise the same string shape.
pub fn unique_account_number() -> String {
    format!("ACC-{}", &Uuid::new_v4().simple().to_string()[..10].to_ascii_uppercase())
}

/// Unique idempotency key for fixture requests.
pub fn unique_idempotency_key() -> String {
    Uuid::new_v4().to_string()
}
