use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::Method;
use don_bus::BusConnection;
use don_cache::CacheClient;
use don_config::Settings;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use totals_service::{consumer, routes, state::AppState};

/// T2 refresh runs on the order of minutes per spec §4.4 ("a scheduled task
/// ... refreshes T2 concurrently to bound the worst-case staleness"); this
/// is independent of and slower than the T1 invalidation the bus consumer
/// performs on every capture.
const SNAPSHOT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    don_config::bootstrap_dotenv();
    don_config::init_tracing();

    let settings = Arc::new(Settings::from_env().context("failed to load settings")?);

    let pool = don_db::connect(&settings.database_url).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run totals-service migrations")?;

    let cache = Arc::new(Mutex::new(
        CacheClient::connect(&settings.cache_url)
            .await
            .context("failed to connect T1 hot cache")?,
    ));

    let bus = Arc::new(
        BusConnection::connect(&settings.broker_url)
            .await
            .context("failed to connect to message bus")?,
    );

    let state = Arc::new(AppState {
        pool: pool.clone(),
        cache: cache.clone(),
        settings: settings.clone(),
    });

    tokio::spawn(consumer::run_mirror(pool.clone(), bus.clone()));
    tokio::spawn(consumer::run_invalidate(pool.clone(), bus, cache));
    tokio::spawn(refresh_snapshot_periodically(pool));

    let app = routes::build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET])
                .allow_origin(Any),
        );

    let addr = settings.bind_addr.parse().context("invalid BIND_ADDR")?;
    tracing::info!(%addr, "totals-service listening");

    axum::serve(
        TcpListener::bind(addr).await.context("failed to bind listener")?,
        app,
    )
    .await
    .context("server crashed")?;

    Ok(())
}

/// Refreshes the T2 `campaign_totals` materialized view. `CONCURRENTLY`
/// keeps it queryable mid-refresh (requires the unique index the migration
/// creates) so the read path never blocks behind this.
async fn refresh_snapshot_periodically(pool: sqlx::PgPool) {
    let mut ticker = tokio::time::interval(SNAPSHOT_REFRESH_INTERVAL);
    loop {
        ticker.tick().await;
        let result = sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY campaign_totals")
            .execute(&pool)
            .await;

        match result {
            Ok(_) => tracing::debug!("refreshed campaign_totals snapshot"),
            Err(err) => tracing::warn!(error = %err, "campaign_totals snapshot refresh failed"),
        }
    }
}
