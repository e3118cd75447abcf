use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fleetwarden_common::bus::{NotificationEnvelope, Severity, CHANNEL_NOTIFICATIONS};
use redis::AsyncCommands;

const SOURCE: &str = "fleetwarden-orchestrator";

/// Fire-and-forget operator alerts. Implementations never fail the caller.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, severity: Severity, message: &str);
}

pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => tracing::info!(severity = severity.as_str(), "📣 {}", message),
            Severity::Warning => tracing::warn!(severity = severity.as_str(), "📣 {}", message),
            Severity::Critical => tracing::error!(severity = severity.as_str(), "🚨 {}", message),
        }
    }
}

/// Publishes envelopes on `fleet_notifications`.
pub struct RedisSink {
    client: redis::Client,
}

impl RedisSink {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn publish(&self, envelope: &NotificationEnvelope) -> anyhow::Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis (notifier)")?;
        let payload = serde_json::to_string(envelope)?;
        let _: () = conn.publish(CHANNEL_NOTIFICATIONS, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for RedisSink {
    async fn notify(&self, severity: Severity, message: &str) {
        let envelope = NotificationEnvelope::new(severity, message, SOURCE);
        if let Err(e) = self.publish(&envelope).await {
            tracing::warn!("⚠️ [notifier] redis publish failed: {:#}", e);
        }
    }
}

/// POSTs the JSON envelope to an operator webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, severity: Severity, message: &str) {
        let envelope = NotificationEnvelope::new(severity, message, SOURCE);
        let res = self.client.post(&self.url).json(&envelope).send().await;
        match res {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!("⚠️ [notifier] webhook returned {}", resp.status());
            }
            Err(e) => tracing::warn!("⚠️ [notifier] webhook failed: {}", e),
            Ok(_) => {}
        }
    }
}

/// Delivers to every inner sink in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn notify(&self, severity: Severity, message: &str) {
        for sink in &self.sinks {
            sink.notify(severity, message).await;
        }
    }
}

/// Keeps every notification in memory. Used by tests and the local dev profile.
#[derive(Default)]
pub struct MemorySink {
    messages: Mutex<Vec<(Severity, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(Severity, String)> {
        match self.messages.lock() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn notify(&self, severity: Severity, message: &str) {
        match self.messages.lock() {
            Ok(mut m) => m.push((severity, message.to_string())),
            Err(poisoned) => poisoned.into_inner().push((severity, message.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fan = FanoutSink::new(vec![a.clone(), b.clone(), Arc::new(TracingSink)]);
        fan.notify(Severity::Critical, "3 failovers in 1 hour").await;
        assert_eq!(a.messages().len(), 1);
        assert_eq!(b.messages()[0].0, Severity::Critical);
    }
}
