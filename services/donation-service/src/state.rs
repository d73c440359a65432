use std::sync::Arc;

use don_cache::CacheClient;
use don_config::Settings;
use sqlx::PgPool;
use tokio::sync::Mutex;

/// Shared handle cloned into every Axum handler. `pool` is itself a
/// connection pool (cheap to clone); the cache client wraps a single
/// multiplexed Redis connection behind a mutex the way every cache-aside
/// call site in this service needs `&mut self`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub cache: Arc<Mutex<CacheClient>>,
    pub settings: Arc<Settings>,
}
