use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// A templated message for a user
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Template name, e.g. `verify`
    pub kind: String,
    pub receiver: String,
    pub subject: String,
    pub username: String,
    pub token: String,
}

/// Delivers notifications. Delivery is best-effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Records notifications in the structured log instead of delivering them
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, notification: Notification) -> anyhow::Result<()> {
        info!(
            kind = %notification.kind,
            receiver = %notification.receiver,
            subject = %notification.subject,
            "Notification queued"
        );
        Ok(())
    }
}

/// Send on a background task; failures are logged and dropped
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        let kind = notification.kind.clone();
        if let Err(e) = notifier.send(notification).await {
            warn!(kind = %kind, error = %e, "Failed to send notification");
            metrics::counter!("photos.notifications.failed").increment(1);
        }
    });
}
