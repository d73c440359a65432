//! T1 hot-cache client.
//!
//! This crate only implements the hot tier (T1). T2 (pre-aggregated
//! snapshot row) and T3 (authoritative recount query) are plain SQL queries
//! against each service's own schema and live in that service — there is
//! nothing generic to share there. What every tiered read path shares is
//! cache-aside get/set/invalidate against Redis, which is what this crate
//! provides (grounded in the same `redis` dependency the reference pack's
//! `vm31-relayer` service uses for its own hot cache).

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Clone)]
pub struct CacheClient {
    conn: ConnectionManager,
}

impl CacheClient {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis cache")?;
        Ok(Self { conn })
    }

    pub async fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self.conn.get(key).await.context("cache get failed")?;
        match raw {
            Some(s) => {
                let value = serde_json::from_str(&s).context("cache value deserialize failed")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&mut self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(value).context("cache value serialize failed")?;
        let _: () = self
            .conn
            .set_ex(key, raw, ttl.as_secs())
            .await
            .context("cache set failed")?;
        Ok(())
    }

    pub async fn invalidate(&mut self, key: &str) -> Result<()> {
        let _: () = self.conn.del(key).await.context("cache invalidate failed")?;
        Ok(())
    }
}

/// Cache key for a campaign's totals aggregate (T1, 30s TTL per spec §4.4).
pub fn campaign_totals_key(campaign_id: &uuid::Uuid) -> String {
    format!("totals:campaign:{campaign_id}")
}

/// Cache key for a single donation record (5 min TTL), used by
/// `donation-service`'s GET-by-id cache-aside path.
pub fn donation_key(pledge_id: &uuid::Uuid) -> String {
    format!("donation:{pledge_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_totals_key_is_stable_for_same_id() {
        let id = uuid::Uuid::nil();
        assert_eq!(campaign_totals_key(&id), campaign_totals_key(&id));
    }

    #[test]
    fn donation_key_differs_from_campaign_key_for_same_id() {
        let id = uuid::Uuid::nil();
        assert_ne!(campaign_totals_key(&id), donation_key(&id));
    }
}
