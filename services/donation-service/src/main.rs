use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::Method;
use don_bus::BusConnection;
use don_cache::CacheClient;
use don_config::Settings;
use donation_service::{consumer, outbox_poller, routes, state::AppState};
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
        .context("failed to run donation-service migrations")?;

    let cache = CacheClient::connect(&settings.cache_url)
        .await
        .context("failed to connect to cache")?;

    let bus = Arc::new(
        BusConnection::connect(&settings.broker_url)
            .await
            .context("failed to connect to message bus")?,
    );

    let cache = Arc::new(Mutex::new(cache));

    let state = Arc::new(AppState {
        pool: pool.clone(),
        cache: cache.clone(),
        settings: settings.clone(),
    });

    tokio::spawn(outbox_poller::run(pool.clone(), bus.clone(), settings.clone()));
    tokio::spawn(consumer::run(pool, bus, cache));

    let app = routes::build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::PATCH])
                .allow_origin(Any),
        );

    let addr = settings.bind_addr.parse().context("invalid BIND_ADDR")?;
    tracing::info!(%addr, "donation-service listening");

    axum::serve(
        TcpListener::bind(addr).await.context("failed to bind listener")?,
        app,
    )
    .await
    .context("server crashed")?;

    Ok(())
}
