//! Narrow capability traits the pipeline depends on.
//!
//! `db::Database` implements the store traits over SQLite and `notify` provides host
//! notifiers; tests swap in the in-memory doubles from `testing`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{CalendarEvent, MemoryFragment, Message, NewMessage, ScheduledMessage};

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message and returns it with its store-assigned id.
    async fn insert_message(&self, message: NewMessage) -> anyhow::Result<Message>;

    async fn delete_messages(&self, ids: &[i64]) -> anyhow::Result<usize>;

    /// Full history of a conversation, oldest first.
    async fn fetch_history(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>>;
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Fragments in the order they were appended.
    async fn list_fragments(&self, conversation_id: &str) -> anyhow::Result<Vec<MemoryFragment>>;

    async fn append_fragments(
        &self,
        conversation_id: &str,
        fragments: &[MemoryFragment],
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AgendaStore: Send + Sync {
    async fn upsert_scheduled_message(&self, scheduled: &ScheduledMessage) -> anyhow::Result<()>;

    async fn upsert_calendar_event(&self, event: &CalendarEvent) -> anyhow::Result<()>;

    async fn due_scheduled_messages(
        &self,
        now: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<ScheduledMessage>>;

    async fn delete_scheduled_message(&self, id: &str) -> anyhow::Result<()>;
}

/// Host-side notification surface. Every method is best-effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn schedule_alert(
        &self,
        title: &str,
        body: &str,
        fire_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Short transient popup.
    fn toast(&self, text: &str);

    /// Interim progress line shown while a turn is still running.
    fn status(&self, text: &str);
}
