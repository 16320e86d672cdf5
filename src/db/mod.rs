use anyhow::Context as _;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, ToSql};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::PipelineError;
use crate::model::{
    ArchiveTemplate, CalendarEvent, MemoryFragment, Message, MessageType, NewMessage, Role,
    ScheduledMessage, DEFAULT_ARCHIVE_TEMPLATE,
};
use crate::segmenter::EmojiCatalog;

mod schema;
mod stores;

pub use schema::SCHEMA;

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, kind, content, reply_to, metadata, timestamp";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(&config.database_url)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        Self::open(&config.database_url)
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {path}"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::LockPoisoned.into())
    }

    /// Runs a synchronous database call on the blocking pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("Database task panicked")?
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO archive_templates (name, template) VALUES ('default', ?1)",
            (DEFAULT_ARCHIVE_TEMPLATE,),
        )?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    // --- Messages ---

    pub fn insert_message(&self, message: &NewMessage) -> anyhow::Result<Message> {
        let reply_to = message
            .reply_to
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (conversation_id, role, kind, content, reply_to, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                &message.conversation_id,
                message.role,
                message.kind,
                &message.content,
                reply_to,
                metadata,
                message.timestamp,
            ),
        )?;
        let id = conn.last_insert_rowid();
        debug!(
            "Database: Saved {} {} message {} in conversation {}",
            message.role,
            message.kind.as_str(),
            id,
            message.conversation_id
        );
        Ok(message.clone().into_message(id))
    }

    pub fn fetch_history(&self, conversation_id: &str) -> anyhow::Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([conversation_id], message_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn update_message_content(&self, id: i64, content: &str) -> anyhow::Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE messages SET content = ?1 WHERE id = ?2",
            (content, id),
        )?;
        Ok(count)
    }

    pub fn delete_messages(&self, ids: &[i64]) -> anyhow::Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let count = conn.execute(
            &format!("DELETE FROM messages WHERE id IN ({placeholders})"),
            rusqlite::params_from_iter(ids.iter()),
        )?;
        Ok(count)
    }

    pub fn clear_conversation(&self, conversation_id: &str) -> anyhow::Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            (conversation_id,),
        )?;
        Ok(count)
    }

    // --- Memory fragments ---

    pub fn list_fragments(&self, conversation_id: &str) -> anyhow::Result<Vec<MemoryFragment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, date, summary, mood, created_at
             FROM memory_fragments WHERE conversation_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            Ok(MemoryFragment {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                date: row.get(2)?,
                summary: row.get(3)?,
                mood: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Appends fragments in one transaction; existing fragments are never touched.
    pub fn append_fragments(
        &self,
        conversation_id: &str,
        fragments: &[MemoryFragment],
    ) -> anyhow::Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for fragment in fragments {
            tx.execute(
                "INSERT INTO memory_fragments (id, conversation_id, date, summary, mood, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (
                    &fragment.id,
                    conversation_id,
                    &fragment.date,
                    &fragment.summary,
                    &fragment.mood,
                    fragment.created_at,
                ),
            )?;
        }
        tx.commit()?;
        debug!(
            "Database: Appended {} memory fragments to {}",
            fragments.len(),
            conversation_id
        );
        Ok(())
    }

    // --- Agenda ---

    pub fn upsert_scheduled_message(&self, scheduled: &ScheduledMessage) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scheduled_messages (id, conversation_id, content, due_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET content = ?3, due_at = ?4",
            (
                &scheduled.id,
                &scheduled.conversation_id,
                &scheduled.content,
                scheduled.due_at,
                scheduled.created_at,
            ),
        )?;
        Ok(())
    }

    pub fn due_scheduled_messages(
        &self,
        now: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<ScheduledMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, content, due_at, created_at FROM scheduled_messages
             WHERE due_at <= ?1 ORDER BY due_at LIMIT ?2",
        )?;
        let rows = stmt.query_map((now, limit as i64), scheduled_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn list_scheduled_messages(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Vec<ScheduledMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, content, due_at, created_at FROM scheduled_messages
             WHERE conversation_id = ?1 ORDER BY due_at",
        )?;
        let rows = stmt.query_map([conversation_id], scheduled_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn delete_scheduled_message(&self, id: &str) -> anyhow::Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute("DELETE FROM scheduled_messages WHERE id = ?1", (id,))?;
        Ok(count)
    }

    pub fn upsert_calendar_event(&self, event: &CalendarEvent) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO calendar_events (id, conversation_id, title, date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET title = ?3, date = ?4",
            (
                &event.id,
                &event.conversation_id,
                &event.title,
                &event.date,
                event.created_at,
            ),
        )?;
        Ok(())
    }

    pub fn list_calendar_events(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Vec<CalendarEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, title, date, created_at FROM calendar_events
             WHERE conversation_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            Ok(CalendarEvent {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                title: row.get(2)?,
                date: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // --- Archive templates & emojis ---

    pub fn get_archive_template(&self, name: &str) -> anyhow::Result<Option<ArchiveTemplate>> {
        let conn = self.conn()?;
        let template = conn
            .query_row(
                "SELECT id, name, template FROM archive_templates WHERE name = ?1",
                [name],
                |row| {
                    Ok(ArchiveTemplate {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        template: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(template)
    }

    pub fn save_archive_template(&self, name: &str, template: &str) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO archive_templates (name, template) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET template = ?2",
            (name, template),
        )?;
        Ok(())
    }

    pub fn upsert_emoji(&self, name: &str, resource: &str) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO emojis (name, resource) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET resource = ?2",
            (name, resource),
        )?;
        Ok(())
    }

    pub fn load_emoji_catalog(&self) -> anyhow::Result<EmojiCatalog> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name, resource FROM emojis")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut catalog = EmojiCatalog::default();
        for row in rows {
            let (name, resource) = row?;
            catalog.insert(name, resource);
        }
        Ok(catalog)
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let reply_to: Option<String> = row.get(5)?;
    let metadata: Option<String> = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        kind: row.get(3)?,
        content: row.get(4)?,
        // A corrupt JSON column degrades to "absent" instead of hiding the whole message.
        reply_to: reply_to.and_then(|raw| serde_json::from_str(&raw).ok()),
        metadata: metadata.and_then(|raw| serde_json::from_str(&raw).ok()),
        timestamp: row.get(7)?,
    })
}

fn scheduled_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledMessage> {
    Ok(ScheduledMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        content: row.get(2)?,
        due_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for MessageType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MessageType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReplyTo;
    use serde_json::json;

    fn test_db() -> Database {
        let db = Database::open(":memory:").unwrap();
        db.execute_init().unwrap();
        db
    }

    #[test]
    fn test_insert_and_fetch_history() {
        let db = test_db();

        let first = db
            .insert_message(&NewMessage::text("c1", Role::User, "hello").at(1_700_000_000))
            .unwrap();
        let reply = ReplyTo {
            id: first.id,
            content: "hello".to_string(),
            name: "Ada".to_string(),
        };
        let second = db
            .insert_message(
                &NewMessage::new("c1", Role::Assistant, MessageType::Transfer, "500")
                    .with_reply(Some(reply.clone()))
                    .with_metadata(json!({"amount": "500"}))
                    .at(1_700_000_010),
            )
            .unwrap();
        db.insert_message(&NewMessage::text("c2", Role::User, "elsewhere"))
            .unwrap();

        assert!(second.id > first.id);

        let history = db.fetch_history("c1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].kind, MessageType::Transfer);
        assert_eq!(history[1].reply_to, Some(reply));
        assert_eq!(history[1].metadata, Some(json!({"amount": "500"})));
    }

    #[test]
    fn test_edit_delete_and_clear() {
        let db = test_db();
        let a = db.insert_message(&NewMessage::text("c1", Role::User, "a")).unwrap();
        let b = db.insert_message(&NewMessage::text("c1", Role::User, "b")).unwrap();
        let c = db.insert_message(&NewMessage::text("c1", Role::User, "c")).unwrap();

        assert_eq!(db.update_message_content(a.id, "a2").unwrap(), 1);
        assert_eq!(db.delete_messages(&[b.id, c.id]).unwrap(), 2);
        assert_eq!(db.delete_messages(&[]).unwrap(), 0);

        let history = db.fetch_history("c1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "a2");

        assert_eq!(db.clear_conversation("c1").unwrap(), 1);
        assert!(db.fetch_history("c1").unwrap().is_empty());
    }

    #[test]
    fn test_fragments_append_without_replacing() {
        let db = test_db();
        let fragment = |id: &str, date: &str| MemoryFragment {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            date: date.to_string(),
            summary: format!("summary {date}"),
            mood: "archive".to_string(),
            created_at: 0,
        };

        db.append_fragments("c1", &[fragment("f1", "2024-03-01")]).unwrap();
        db.append_fragments("c1", &[fragment("f2", "2024-03-02"), fragment("f3", "2024-03-03")])
            .unwrap();

        let dates: Vec<_> = db
            .list_fragments("c1")
            .unwrap()
            .into_iter()
            .map(|f| f.date)
            .collect();
        assert_eq!(dates, vec!["2024-03-01", "2024-03-02", "2024-03-03"]);
        assert!(db.list_fragments("c2").unwrap().is_empty());
    }

    #[test]
    fn test_scheduled_messages_due_and_delete() {
        let db = test_db();
        let scheduled = |id: &str, due_at: i64| ScheduledMessage {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            content: format!("ping {id}"),
            due_at,
            created_at: 0,
        };
        db.upsert_scheduled_message(&scheduled("late", 300)).unwrap();
        db.upsert_scheduled_message(&scheduled("early", 100)).unwrap();
        db.upsert_scheduled_message(&scheduled("future", 10_000)).unwrap();

        let due = db.due_scheduled_messages(500, 10).unwrap();
        let ids: Vec<_> = due.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);

        assert_eq!(db.delete_scheduled_message("early").unwrap(), 1);
        assert_eq!(db.list_scheduled_messages("c1").unwrap().len(), 2);
    }

    #[test]
    fn test_calendar_event_upsert() {
        let db = test_db();
        let mut event = CalendarEvent {
            id: "e1".to_string(),
            conversation_id: "c1".to_string(),
            title: "Picnic".to_string(),
            date: "2026-05-01".to_string(),
            created_at: 1,
        };
        db.upsert_calendar_event(&event).unwrap();
        event.title = "Picnic at the lake".to_string();
        db.upsert_calendar_event(&event).unwrap();

        let events = db.list_calendar_events("c1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Picnic at the lake");
    }

    #[test]
    fn test_default_template_and_emojis() {
        let db = test_db();
        let template = db.get_archive_template("default").unwrap().unwrap();
        assert!(template.has_log_placeholder());
        assert!(db.get_archive_template("missing").unwrap().is_none());

        db.save_archive_template("default", "short {{log}}").unwrap();
        let template = db.get_archive_template("default").unwrap().unwrap();
        assert_eq!(template.template, "short {{log}}");

        db.upsert_emoji("smile", "emoji/smile.png").unwrap();
        let catalog = db.load_emoji_catalog().unwrap();
        assert_eq!(catalog.resolve("smile"), Some("emoji/smile.png"));
        assert_eq!(catalog.resolve("frown"), None);
    }

    #[test]
    fn test_unknown_role_is_a_read_error() {
        let db = test_db();
        {
            let conn = db.conn().unwrap();
            conn.execute(
                "INSERT INTO messages (conversation_id, role, kind, content, timestamp)
                 VALUES ('c1', 'narrator', 'text', 'x', 0)",
                [],
            )
            .unwrap();
        }
        assert!(db.fetch_history("c1").is_err());
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let db = test_db();
        let saved = db
            .run_blocking(|db| db.insert_message(&NewMessage::text("c1", Role::User, "hi")))
            .await
            .unwrap();
        assert_eq!(saved.content, "hi");
    }
}
