//! Environment-variable configuration loading.
//!
//! Every service reads its settings once at startup via [`Settings::from_env`].
//! There is no layered-file config here: the external surface is a flat set
//! of env vars (see spec §6), so a single struct with `anyhow::Context` on
//! each lookup is sufficient — no YAML merge step is needed.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Settings common to every service binary.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub cache_url: String,
    pub broker_url: String,
    pub bind_addr: String,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: u32,
    pub outbox_max_retries: u32,
    pub idempotency_ttl: Duration,
    pub totals_cache_ttl: Duration,
    /// Spec §6 configuration limit: `MAX_PLEDGE`, in cents. donation-service
    /// rejects any pledge above this with a 422.
    pub max_pledge_cents: i64,
    /// Spec §6 configuration limit: `MAX_TRANSFER`, in cents. Enforced by
    /// `don_ledger::execute_transfer`.
    pub max_transfer_cents: i64,
}

impl Settings {
    /// Loads settings from the process environment, applying the defaults
    /// named in spec §6 for anything not overridden.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            cache_url: env_or("CACHE_URL", "redis://127.0.0.1:6379"),
            broker_url: env_or("BROKER_URL", "amqp://127.0.0.1:5672/%2f"),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            outbox_poll_interval: Duration::from_millis(env_u64_or(
                "OUTBOX_POLL_INTERVAL_MS",
                1_000,
            )?),
            outbox_batch_size: env_u32_or("OUTBOX_BATCH_SIZE", 50)?,
            outbox_max_retries: env_u32_or("OUTBOX_MAX_RETRIES", 5)?,
            idempotency_ttl: Duration::from_secs(env_u64_or("IDEMPOTENCY_TTL_SECS", 86_400)?),
            totals_cache_ttl: Duration::from_secs(env_u64_or("TOTALS_CACHE_TTL_SECS", 30)?),
            max_pledge_cents: env_i64_or("MAX_PLEDGE_CENTS", 1_000_000_00)?,
            max_transfer_cents: env_i64_or("MAX_TRANSFER_CENTS", 1_000_000_00)?,
        })
    }
}

/// Loads a `.env.local` file if present; silently continues if absent,
/// matching dev-only bootstrap convention used across the workspace.
pub fn bootstrap_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("missing required env var {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("invalid {key}: {v}")),
        Err(_) => Ok(default),
    }
}

fn env_u32_or(key: &str, default: u32) -> Result<u32> {
    match env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("invalid {key}: {v}")),
        Err(_) => Ok(default),
    }
}

fn env_i64_or(key: &str, default: i64) -> Result<i64> {
    match env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("invalid {key}: {v}")),
        Err(_) => Ok(default),
    }
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
