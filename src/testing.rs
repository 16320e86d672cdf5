//! In-memory doubles for the capability traits, shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::llm::{ChatTurn, Generation, GenerationOptions, Generator};
use crate::model::{
    CalendarEvent, MemoryFragment, Message, NewMessage, ScheduledMessage, ARCHIVE_MOOD,
};
use crate::store::{AgendaStore, MemoryStore, MessageStore, Notifier};

pub fn fragment(conversation_id: &str, date: &str, summary: &str) -> MemoryFragment {
    MemoryFragment {
        id: uuid::Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        date: date.to_string(),
        summary: summary.to_string(),
        mood: ARCHIVE_MOOD.to_string(),
        created_at: 0,
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    next_id: AtomicI64,
    messages: Mutex<Vec<Message>>,
    fragments: Mutex<Vec<MemoryFragment>>,
    scheduled: Mutex<Vec<ScheduledMessage>>,
    events: Mutex<Vec<CalendarEvent>>,
    fail_inserts: Mutex<bool>,
}

impl InMemoryStore {
    pub fn seed_message(&self, message: NewMessage) -> Message {
        let message = message.into_message(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.messages.lock().unwrap().push(message.clone());
        message
    }

    pub fn seed_fragment(&self, fragment: MemoryFragment) {
        self.fragments.lock().unwrap().push(fragment);
    }

    pub fn seed_scheduled(&self, scheduled: ScheduledMessage) {
        self.scheduled.lock().unwrap().push(scheduled);
    }

    /// Makes every later `insert_message` fail.
    pub fn fail_inserts(&self) {
        *self.fail_inserts.lock().unwrap() = true;
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn fragments(&self) -> Vec<MemoryFragment> {
        self.fragments.lock().unwrap().clone()
    }

    pub fn scheduled(&self) -> Vec<ScheduledMessage> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn insert_message(&self, message: NewMessage) -> anyhow::Result<Message> {
        if *self.fail_inserts.lock().unwrap() {
            anyhow::bail!("store is read-only");
        }
        Ok(self.seed_message(message))
    }

    async fn delete_messages(&self, ids: &[i64]) -> anyhow::Result<usize> {
        let mut messages = self.messages.lock().unwrap();
        let before = messages.len();
        messages.retain(|m| !ids.contains(&m.id));
        Ok(before - messages.len())
    }

    async fn fetch_history(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .messages()
            .into_iter()
            .filter(|m| m.conversation_id == conversation_id)
            .collect())
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn list_fragments(&self, conversation_id: &str) -> anyhow::Result<Vec<MemoryFragment>> {
        Ok(self
            .fragments()
            .into_iter()
            .filter(|f| f.conversation_id == conversation_id)
            .collect())
    }

    async fn append_fragments(
        &self,
        _conversation_id: &str,
        fragments: &[MemoryFragment],
    ) -> anyhow::Result<()> {
        self.fragments.lock().unwrap().extend_from_slice(fragments);
        Ok(())
    }
}

#[async_trait]
impl AgendaStore for InMemoryStore {
    async fn upsert_scheduled_message(&self, scheduled: &ScheduledMessage) -> anyhow::Result<()> {
        let mut all = self.scheduled.lock().unwrap();
        all.retain(|s| s.id != scheduled.id);
        all.push(scheduled.clone());
        Ok(())
    }

    async fn upsert_calendar_event(&self, event: &CalendarEvent) -> anyhow::Result<()> {
        let mut all = self.events.lock().unwrap();
        all.retain(|e| e.id != event.id);
        all.push(event.clone());
        Ok(())
    }

    async fn due_scheduled_messages(
        &self,
        now: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<ScheduledMessage>> {
        let mut due: Vec<_> = self
            .scheduled()
            .into_iter()
            .filter(|s| s.due_at <= now)
            .collect();
        due.sort_by_key(|s| s.due_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_scheduled_message(&self, id: &str) -> anyhow::Result<()> {
        self.scheduled.lock().unwrap().retain(|s| s.id != id);
        Ok(())
    }
}

/// Replays scripted completions in order and records every request it saw.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<Vec<ChatTurn>>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Result<&'static str, &'static str>>) -> Self {
        Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Vec<ChatTurn>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        turns: &[ChatTurn],
        _options: GenerationOptions,
    ) -> anyhow::Result<Generation> {
        self.requests.lock().unwrap().push(turns.to_vec());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Ok(text)) => Ok(Generation { text, usage: None }),
            Some(Err(error)) => Err(anyhow::anyhow!(error)),
            None => Err(anyhow::anyhow!("script exhausted")),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<(String, String, DateTime<Utc>)>>,
    toasts: Mutex<Vec<String>>,
    statuses: Mutex<Vec<String>>,
    fail_alerts: bool,
}

impl RecordingNotifier {
    /// A notifier whose alerts always fail.
    pub fn failing() -> Self {
        Self {
            fail_alerts: true,
            ..Self::default()
        }
    }

    pub fn alerts(&self) -> Vec<(String, String, DateTime<Utc>)> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn toasts(&self) -> Vec<String> {
        self.toasts.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn schedule_alert(
        &self,
        title: &str,
        body: &str,
        fire_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if self.fail_alerts {
            anyhow::bail!("notification permission denied");
        }
        self.alerts
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string(), fire_at));
        Ok(())
    }

    fn toast(&self, text: &str) {
        self.toasts.lock().unwrap().push(text.to_string());
    }

    fn status(&self, text: &str) {
        self.statuses.lock().unwrap().push(text.to_string());
    }
}
