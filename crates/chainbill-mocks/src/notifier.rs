use std::sync::Arc;

use async_trait::async_trait;
use chainbill_tools::{Notification, NotificationSender};
use tokio::sync::RwLock;

/// Mock notification sender that keeps every delivered notification.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<RwLock<Vec<Notification>>>,
    fail_next: Arc<RwLock<bool>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next send fail without recording it.
    pub async fn set_fail_next(&self, fail: bool) {
        *self.fail_next.write().await = fail;
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.read().await.len()
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        let mut fail_next = self.fail_next.write().await;
        if *fail_next {
            *fail_next = false;
            anyhow::bail!("mock notifier configured to fail");
        }
        drop(fail_next);

        self.sent.write().await.push(notification.clone());
        Ok(())
    }
}
