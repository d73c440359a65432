//! Postgres pool bootstrap and small cross-service helpers.
//!
//! Each service owns its own schema and its own `migrations/` directory
//! (`sqlx::migrate!` resolves its path relative to the invoking crate's
//! `CARGO_MANIFEST_DIR`, so migrations cannot live in a shared crate here).
//! This crate only provides what every service needs regardless of schema:
//! pool construction and the constraint-violation inspection helper used by
//! every idempotent-insert pattern in the workspace.

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Connects using `DATABASE_URL` already resolved by `don-config`.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
        .with_context(|| "failed to connect to database".to_string())
}

/// Smaller pool, intended for test fixtures that each get a handful of
/// connections rather than a production-sized pool.
pub async fn connect_for_test(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect test database pool")
}

/// True if `err` is a unique-constraint violation on the named constraint.
/// Every idempotent insert in this workspace (`outbox_enqueue`,
/// `idempotency` insert, notification dedup insert) is written as
/// `INSERT ... ON CONFLICT ... DO NOTHING` first; this helper exists for the
/// handful of call sites that cannot express the conflict target in SQL
/// (e.g. conditional multi-column constraints checked post-hoc) and must
/// instead catch the database error directly.
pub fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .constraint()
            .map(|c| c == constraint)
            .unwrap_or(false),
        _ => false,
    }
}

/// Simple connectivity probe used by `/health` endpoints.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .context("db ping failed")?;
    Ok(())
}
