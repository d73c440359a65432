//! Drains the `outbox` table to `payments.events`. Same algorithm as
//! `donation-service::outbox_poller` (spec §4.1); each service polls its
//! own table and exchange independently.

use std::sync::Arc;

use don_bus::BusConnection;
use don_config::Settings;
use sqlx::PgPool;

const EXCHANGE: &str = "payments.events";
const RETENTION_DAYS: i64 = 7;
const PURGE_EVERY_N_ITERATIONS: u64 = 100;

pub async fn run(pool: PgPool, bus: Arc<BusConnection>, settings: Arc<Settings>) {
    let channel = match bus.channel().await {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, "outbox poller failed to open bus channel, exiting");
            return;
        }
    };

    if let Err(err) = don_bus::declare_topic_exchange(&channel, EXCHANGE).await {
        tracing::error!(error = %err, "outbox poller failed to declare exchange, exiting");
        return;
    }

    let mut ticker = tokio::time::interval(settings.outbox_poll_interval);
    let mut iteration: u64 = 0;

    loop {
        ticker.tick().await;
        iteration += 1;

        if let Err(err) = drain_once(&pool, &channel, settings.outbox_batch_size, settings.outbox_max_retries).await {
            tracing::error!(error = %err, "outbox drain iteration failed");
        }

        if iteration % PURGE_EVERY_N_ITERATIONS == 0 {
            match don_outbox::purge_sent_older_than(&pool, RETENTION_DAYS).await {
                Ok(n) if n > 0 => tracing::info!(purged = n, "purged old sent outbox rows"),
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "outbox purge failed"),
            }
        }
    }
}

async fn drain_once(
    pool: &PgPool,
    channel: &lapin::Channel,
    batch_size: u32,
    max_retries: u32,
) -> anyhow::Result<()> {
    let batch = don_outbox::claim_batch(pool, batch_size as i64).await?;
    if batch.is_empty() {
        return Ok(());
    }

    for row in batch {
        let publish = don_bus::publish_json(channel, EXCHANGE, &row.routing_key, &serde_json::to_vec(&row.payload)?).await;

        match publish {
            Ok(()) => {
                don_outbox::mark_sent(pool, row.outbox_id).await?;
            }
            Err(err) => {
                tracing::warn!(outbox_id = %row.outbox_id, error = %err, "outbox publish failed, will retry");
                don_outbox::mark_failed(pool, row.outbox_id, max_retries).await?;
            }
        }
    }

    Ok(())
}
