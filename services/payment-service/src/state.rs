use std::sync::Arc;

use don_config::Settings;
use don_idempotency::IdempotencyGuard;
use sqlx::PgPool;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub idempotency: Arc<Mutex<IdempotencyGuard>>,
    pub settings: Arc<Settings>,
}
