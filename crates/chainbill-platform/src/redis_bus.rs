use anyhow::{Context, Result};
use async_trait::async_trait;
use chainbill_tools::{Notification, NotificationSender};
use redis::{AsyncCommands, Client};
use serde::Serialize;

#[derive(Clone)]
pub struct RedisBus {
    client: Client,
}

impl RedisBus {
    pub fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("invalid REDIS_URL")?;
        Ok(Self { client })
    }

    /// Returns the number of subscribers that received the message.
    pub async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) -> Result<i64> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(payload)?;
        let receivers: i64 = connection.publish(channel, serialized).await?;
        Ok(receivers)
    }
}

/// Hands reminders to the delivery service listening on a Redis channel.
#[derive(Clone)]
pub struct RedisNotificationSender {
    bus: RedisBus,
    channel: String,
}

impl RedisNotificationSender {
    pub fn new(bus: RedisBus, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl NotificationSender for RedisNotificationSender {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let receivers = self
            .bus
            .publish_json(&self.channel, notification)
            .await
            .with_context(|| format!("failed to publish to {}", self.channel))?;
        if receivers == 0 {
            anyhow::bail!("no delivery service is listening on {}", self.channel);
        }
        Ok(())
    }
}
