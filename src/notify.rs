//! Host notifier implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::store::Notifier;

/// Writes every notification to the log. The default host for the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn schedule_alert(
        &self,
        title: &str,
        body: &str,
        fire_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        info!("Alert scheduled for {}: {}: {}", fire_at.to_rfc3339(), title, body);
        Ok(())
    }

    fn toast(&self, text: &str) {
        info!("Toast: {}", text);
    }

    fn status(&self, text: &str) {
        info!("Status: {}", text);
    }
}

/// Drops every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn schedule_alert(
        &self,
        _title: &str,
        _body: &str,
        _fire_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn toast(&self, _text: &str) {}

    fn status(&self, _text: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notifiers_never_fail() {
        let notifiers: [&dyn Notifier; 2] = [&LogNotifier, &NoopNotifier];
        for notifier in notifiers {
            notifier.toast("hello");
            notifier.status("thinking");
            assert!(notifier
                .schedule_alert("Ember", "wake up", Utc::now())
                .await
                .is_ok());
        }
    }
}
