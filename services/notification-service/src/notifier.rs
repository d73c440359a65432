//! The injected `send(recipient, template_id, data) -> ok|fail` capability
//! named in spec §1 as out-of-scope: email/SMS delivery is a black box this
//! service depends on but does not implement. Production wiring would swap
//! `LoggingNotifier` for a real provider client; tests supply `FakeNotifier`.

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, template_id: &str, data: &Value) -> anyhow::Result<()>;
}

/// Default notifier for environments without a configured provider: logs
/// what would have been sent. Never fails, so it never blocks the dedup
/// insert it runs alongside.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, recipient: &str, template_id: &str, data: &Value) -> anyhow::Result<()> {
        tracing::info!(%recipient, %template_id, %data, "notification sent (logging notifier)");
        Ok(())
    }
}
