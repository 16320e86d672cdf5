//! Capability trait implementations for the SQLite database.

use async_trait::async_trait;

use super::Database;
use crate::model::{CalendarEvent, MemoryFragment, Message, NewMessage, ScheduledMessage};
use crate::store::{AgendaStore, MemoryStore, MessageStore};

#[async_trait]
impl MessageStore for Database {
    async fn insert_message(&self, message: NewMessage) -> anyhow::Result<Message> {
        self.run_blocking(move |db| db.insert_message(&message)).await
    }

    async fn delete_messages(&self, ids: &[i64]) -> anyhow::Result<usize> {
        let ids = ids.to_vec();
        self.run_blocking(move |db| db.delete_messages(&ids)).await
    }

    async fn fetch_history(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.run_blocking(move |db| db.fetch_history(&conversation_id))
            .await
    }
}

#[async_trait]
impl MemoryStore for Database {
    async fn list_fragments(&self, conversation_id: &str) -> anyhow::Result<Vec<MemoryFragment>> {
        let conversation_id = conversation_id.to_string();
        self.run_blocking(move |db| db.list_fragments(&conversation_id))
            .await
    }

    async fn append_fragments(
        &self,
        conversation_id: &str,
        fragments: &[MemoryFragment],
    ) -> anyhow::Result<()> {
        let conversation_id = conversation_id.to_string();
        let fragments = fragments.to_vec();
        self.run_blocking(move |db| db.append_fragments(&conversation_id, &fragments))
            .await
    }
}

#[async_trait]
impl AgendaStore for Database {
    async fn upsert_scheduled_message(&self, scheduled: &ScheduledMessage) -> anyhow::Result<()> {
        let scheduled = scheduled.clone();
        self.run_blocking(move |db| db.upsert_scheduled_message(&scheduled))
            .await
    }

    async fn upsert_calendar_event(&self, event: &CalendarEvent) -> anyhow::Result<()> {
        let event = event.clone();
        self.run_blocking(move |db| db.upsert_calendar_event(&event))
            .await
    }

    async fn due_scheduled_messages(
        &self,
        now: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<ScheduledMessage>> {
        self.run_blocking(move |db| db.due_scheduled_messages(now, limit))
            .await
    }

    async fn delete_scheduled_message(&self, id: &str) -> anyhow::Result<()> {
        let id = id.to_string();
        self.run_blocking(move |db| db.delete_scheduled_message(&id).map(|_| ()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    #[tokio::test]
    async fn test_trait_objects_share_one_database() {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();

        let messages: &dyn MessageStore = &db;
        let saved = messages
            .insert_message(NewMessage::text("c1", Role::User, "hello"))
            .await
            .unwrap();
        let history = messages.fetch_history("c1").await.unwrap();
        assert_eq!(history, vec![saved.clone()]);

        assert_eq!(messages.delete_messages(&[saved.id]).await.unwrap(), 1);
        assert!(messages.fetch_history("c1").await.unwrap().is_empty());
    }
}
