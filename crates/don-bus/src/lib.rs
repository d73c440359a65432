//! Topic-exchange publish/consume helpers over the shared message bus.
//!
//! Each service publishes onto its own topic exchange (`donations.events`,
//! `payments.events`, `bank.events`) with a routing key of the shape
//! `<service>.<event_type lowercased>`, and consumers bind a durable queue
//! to the routing keys they care about. Messages are always published
//! persistent (`delivery_mode = 2`) so a broker restart does not silently
//! drop undelivered work — this is the one piece of the outbox's
//! at-least-once guarantee that lives on the broker side rather than in
//! Postgres.

use anyhow::{Context, Result};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};

pub struct BusConnection {
    conn: Connection,
}

impl BusConnection {
    pub async fn connect(url: &str) -> Result<Self> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("failed to connect to message bus")?;
        Ok(Self { conn })
    }

    /// Opens a channel and puts it into publisher-confirm mode. Every
    /// channel this bus hands out is confirm-mode by construction, so
    /// `publish_json`'s awaited `PublisherConfirm` always actually waits on
    /// the broker instead of resolving immediately against a channel that
    /// was never asked to confirm.
    pub async fn channel(&self) -> Result<Channel> {
        let channel = self
            .conn
            .create_channel()
            .await
            .context("failed to open bus channel")?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("failed to put bus channel into confirm mode")?;
        Ok(channel)
    }
}

/// Declares a durable topic exchange. Idempotent: re-declaring with the same
/// arguments is a no-op.
pub async fn declare_topic_exchange(channel: &Channel, exchange: &str) -> Result<()> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("failed to declare exchange {exchange}"))?;
    Ok(())
}

/// Declares a durable queue and binds it to `exchange` for `routing_key`.
/// Consumers call this once at startup before entering their consume loop.
pub async fn declare_bound_queue(
    channel: &Channel,
    exchange: &str,
    queue: &str,
    routing_key: &str,
) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("failed to declare queue {queue}"))?;

    channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("failed to bind queue {queue} to {exchange}/{routing_key}"))?;

    Ok(())
}

/// Publishes a persistent JSON message. Waits for broker confirmation
/// before returning so the caller (the outbox poller) only marks a row
/// `sent` once the broker has actually accepted it.
pub async fn publish_json(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
) -> Result<()> {
    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            payload,
            BasicProperties::default()
                .with_delivery_mode(2)
                .with_content_type("application/json".into()),
        )
        .await
        .with_context(|| format!("failed to publish to {exchange}/{routing_key}"))?;

    confirm
        .await
        .context("broker did not confirm publish")?;

    Ok(())
}

/// Declares a consumer queue wired to a dead-letter exchange, the shape
/// every consumer in spec §4.5 needs: "on decode error, acknowledge and
/// route to a dead-letter queue". `queue` is bound to `exchange`/`routing_key`
/// as the work queue; messages nacked with `requeue = false` (decode
/// failures) land on `<queue>.dead`, bound to a fanout exchange named
/// `<queue>.dlx`.
pub async fn declare_consumer_queue(
    channel: &Channel,
    exchange: &str,
    queue: &str,
    routing_key: &str,
) -> Result<()> {
    let dlx = format!("{queue}.dlx");
    let dead_queue = format!("{queue}.dead");

    channel
        .exchange_declare(
            &dlx,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("failed to declare dead-letter exchange {dlx}"))?;

    channel
        .queue_declare(
            &dead_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("failed to declare dead-letter queue {dead_queue}"))?;

    channel
        .queue_bind(&dead_queue, &dlx, "", QueueBindOptions::default(), FieldTable::default())
        .await
        .with_context(|| format!("failed to bind dead-letter queue {dead_queue}"))?;

    let mut args = FieldTable::default();
    args.insert("x-dead-letter-exchange".into(), lapin::types::AMQPValue::LongString(dlx.into()));

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await
        .with_context(|| format!("failed to declare queue {queue}"))?;

    channel
        .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
        .await
        .with_context(|| format!("failed to bind queue {queue} to {exchange}/{routing_key}"))?;

    Ok(())
}

/// Opens a manual-ack consumer on `queue`.
pub async fn consume(channel: &Channel, queue: &str, consumer_tag: &str) -> Result<Consumer> {
    channel
        .basic_consume(
            queue,
            consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("failed to start consuming {queue}"))
}

pub async fn ack(delivery: &lapin::message::Delivery) -> Result<()> {
    delivery
        .ack(BasicAckOptions::default())
        .await
        .context("ack failed")
}

/// Negative-acks a delivery. `requeue = false` routes it to the queue's
/// dead-letter exchange when one is configured (decode failures always use
/// `requeue = false` — retrying a message that failed to parse cannot
/// succeed on a second attempt).
pub async fn nack(delivery: &lapin::message::Delivery, requeue: bool) -> Result<()> {
    delivery
        .nack(BasicNackOptions {
            requeue,
            ..Default::default()
        })
        .await
        .context("nack failed")
}

/// Routing key convention shared by every publisher: `<service>.<event_type>`,
/// lowercased, matching the original system's `donation.<event_type.lower()>`.
pub fn routing_key(service_prefix: &str, event_type: &str) -> String {
    format!("{service_prefix}.{}", event_type.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_lowercases_event_type() {
        assert_eq!(routing_key("donation", "STATUS_CHANGED"), "donation.status_changed");
    }
}
