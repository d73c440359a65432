use std::sync::Arc;

use anyhow::{Context, Result};
use don_bus::BusConnection;
use don_config::Settings;
use notification_service::notifier::{LoggingNotifier, Notifier};
use notification_service::consumer;

#[tokio::main]
async fn main() -> Result<()> {
    don_config::bootstrap_dotenv();
    don_config::init_tracing();

    let settings = Arc::new(Settings::from_env().context("failed to load settings")?);

    let pool = don_db::connect(&settings.database_url).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run notification-service migrations")?;

    let bus = Arc::new(
        BusConnection::connect(&settings.broker_url)
            .await
            .context("failed to connect to message bus")?,
    );

    let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier);

    tracing::info!("notification-service starting consumer loops");

    let mirror = tokio::spawn(consumer::run_contact_mirror(pool.clone(), bus.clone()));
    let notify = tokio::spawn(consumer::run_capture_notifier(pool, bus, notifier));

    tokio::select! {
        _ = mirror => tracing::error!("contact mirror consumer exited"),
        _ = notify => tracing::error!("capture notifier consumer exited"),
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
    }

    Ok(())
}
