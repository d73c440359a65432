use std::sync::Arc;

use don_cache::CacheClient;
use don_config::Settings;
use sqlx::PgPool;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub cache: Arc<Mutex<CacheClient>>,
    pub settings: Arc<Settings>,
}
