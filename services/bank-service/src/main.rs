use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::Method;
use bank_service::{outbox_poller, routes, state::AppState};
use don_config::Settings;
use don_idempotency::IdempotencyGuard;
use don_bus::BusConnection;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<()> {
    don_config::bootstrap_dotenv();
    don_config::init_tracing();

    let settings = Arc::new(Settings::from_env().context("failed to load settings")?);

    let pool = don_db::connect(&settings.database_url).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run bank-service migrations")?;

    let idempotency = IdempotencyGuard::connect(&settings.cache_url, settings.idempotency_ttl)
        .await
        .context("failed to connect idempotency L1 cache")?;

    let bus = Arc::new(
        BusConnection::connect(&settings.broker_url)
            .await
            .context("failed to connect to message bus")?,
    );

    let state = Arc::new(AppState {
        pool: pool.clone(),
        idempotency: Arc::new(Mutex::new(idempotency)),
        settings: settings.clone(),
    });

    tokio::spawn(outbox_poller::run(pool, bus, settings.clone()));
    tokio::spawn(purge_expired_idempotency_keys(state.pool.clone()));

    let app = routes::build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_origin(Any),
        );

    let addr = settings.bind_addr.parse().context("invalid BIND_ADDR")?;
    tracing::info!(%addr, "bank-service listening");

    axum::serve(
        TcpListener::bind(addr).await.context("failed to bind listener")?,
        app,
    )
    .await
    .context("server crashed")?;

    Ok(())
}

/// Purges idempotency rows past the expiry window named in spec §3
/// (`IdempotencyRecord.expires_at`). Runs independently of the request
/// path — a failed purge tick never blocks a handler.
async fn purge_expired_idempotency_keys(pool: sqlx::PgPool) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    loop {
        ticker.tick().await;
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < now()")
            .execute(&pool)
            .await;

        match result {
            Ok(r) if r.rows_affected() > 0 => {
                tracing::info!(purged = r.rows_affected(), "purged expired idempotency keys")
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "idempotency purge failed"),
        }
    }
}
