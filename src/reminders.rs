use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::model::{Message, NewMessage, Role, ScheduledMessage};
use crate::store::{AgendaStore, MessageStore};

/// Turns due scheduled messages into real assistant messages.
pub struct ScheduledDispatcher {
    agenda: Arc<dyn AgendaStore>,
    messages: Arc<dyn MessageStore>,
    outbox: Option<mpsc::UnboundedSender<Message>>,
    poll_interval: Duration,
    batch_size: usize,
}

impl ScheduledDispatcher {
    pub fn new(
        agenda: Arc<dyn AgendaStore>,
        messages: Arc<dyn MessageStore>,
        outbox: Option<mpsc::UnboundedSender<Message>>,
        poll_interval_secs: u64,
        batch_size: usize,
    ) -> Self {
        Self {
            agenda,
            messages,
            outbox,
            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
            batch_size,
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.dispatch_due(Utc::now()).await {
                error!("Scheduled message dispatch cycle failed: {}", e);
            }
        }
    }

    /// Delivers everything due at `now`; returns how many were delivered.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let due = self
            .agenda
            .due_scheduled_messages(now.timestamp(), self.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut delivered = 0;
        for scheduled in due {
            match self.deliver(&scheduled, now).await {
                Ok(message) => {
                    if let Some(outbox) = &self.outbox {
                        if outbox.send(message).is_err() {
                            debug!(
                                "Scheduled message {} not published, outbox closed",
                                scheduled.id
                            );
                        }
                    }
                    if let Err(e) = self.agenda.delete_scheduled_message(&scheduled.id).await {
                        error!("Failed to delete scheduled message {}: {}", scheduled.id, e);
                    }
                    delivered += 1;
                }
                Err(e) => {
                    error!("Failed to deliver scheduled message {}: {}", scheduled.id, e);
                }
            }
        }

        info!("Delivered {} scheduled message(s)", delivered);
        Ok(delivered)
    }

    async fn deliver(
        &self,
        scheduled: &ScheduledMessage,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Message> {
        self.messages
            .insert_message(
                NewMessage::text(&scheduled.conversation_id, Role::Assistant, &scheduled.content)
                    .with_metadata(json!({ "scheduled_id": scheduled.id }))
                    .at(now.timestamp()),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryStore;

    fn scheduled(id: &str, conversation_id: &str, due_at: i64) -> ScheduledMessage {
        ScheduledMessage {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            content: format!("ping {id}"),
            due_at,
            created_at: 0,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_000, 0).unwrap()
    }

    #[tokio::test]
    async fn test_due_messages_are_delivered_and_removed() {
        let store = Arc::new(InMemoryStore::default());
        store.seed_scheduled(scheduled("a", "c1", 900));
        store.seed_scheduled(scheduled("b", "c2", 1_000));
        store.seed_scheduled(scheduled("later", "c1", 5_000));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = ScheduledDispatcher::new(store.clone(), store.clone(), Some(tx), 30, 20);

        let delivered = dispatcher.dispatch_due(now()).await.unwrap();

        assert_eq!(delivered, 2);
        let messages = store.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].conversation_id, "c1");
        assert_eq!(messages[0].content, "ping a");
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].metadata.as_ref().unwrap()["scheduled_id"], "a");
        assert_eq!(messages[1].conversation_id, "c2");

        let remaining: Vec<_> = store.scheduled().into_iter().map(|s| s.id).collect();
        assert_eq!(remaining, vec!["later".to_string()]);
        assert_eq!(rx.recv().await.unwrap(), messages[0]);
        assert_eq!(rx.recv().await.unwrap(), messages[1]);

        assert_eq!(dispatcher.dispatch_due(now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_insert_keeps_record() {
        let store = Arc::new(InMemoryStore::default());
        store.seed_scheduled(scheduled("a", "c1", 900));
        store.fail_inserts();
        let dispatcher = ScheduledDispatcher::new(store.clone(), store.clone(), None, 30, 20);

        assert_eq!(dispatcher.dispatch_due(now()).await.unwrap(), 0);
        assert_eq!(store.scheduled().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_limits_a_cycle() {
        let store = Arc::new(InMemoryStore::default());
        for i in 0..5 {
            store.seed_scheduled(scheduled(&format!("m{i}"), "c1", 100 + i));
        }
        let dispatcher = ScheduledDispatcher::new(store.clone(), store.clone(), None, 30, 2);

        assert_eq!(dispatcher.dispatch_due(now()).await.unwrap(), 2);
        assert_eq!(store.scheduled().len(), 3);
    }
}
