//! Persisted domain records shared by the pipeline stages and the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Mood tag attached to every fragment produced by the archival pipeline.
pub const ARCHIVE_MOOD: &str = "archive";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(PipelineError::UnknownVariant {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Emoji,
    Image,
    Transfer,
    Interaction,
    SocialCard,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Emoji => "emoji",
            MessageType::Image => "image",
            MessageType::Transfer => "transfer",
            MessageType::Interaction => "interaction",
            MessageType::SocialCard => "social_card",
            MessageType::System => "system",
        }
    }

    /// Placeholder used wherever a non-text message has to be flattened into a log line.
    pub fn marker(&self) -> &'static str {
        match self {
            MessageType::Text => "",
            MessageType::Emoji => "[sticker]",
            MessageType::Image => "[image]",
            MessageType::Transfer => "[transfer]",
            MessageType::Interaction => "[poke]",
            MessageType::SocialCard => "[shared card]",
            MessageType::System => "[system notice]",
        }
    }
}

impl FromStr for MessageType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "emoji" => Ok(MessageType::Emoji),
            "image" => Ok(MessageType::Image),
            "transfer" => Ok(MessageType::Transfer),
            "interaction" => Ok(MessageType::Interaction),
            "social_card" => Ok(MessageType::SocialCard),
            "system" => Ok(MessageType::System),
            other => Err(PipelineError::UnknownVariant {
                kind: "message type",
                value: other.to_string(),
            }),
        }
    }
}

/// Reference to an earlier human message that a reply quotes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTo {
    pub id: i64,
    pub content: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub role: Role,
    pub kind: MessageType,
    pub content: String,
    pub reply_to: Option<ReplyTo>,
    pub metadata: Option<Value>,
    /// Unix seconds.
    pub timestamp: i64,
}

impl Message {
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

/// A message that has not been assigned an id by the store yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: Role,
    pub kind: MessageType,
    pub content: String,
    pub reply_to: Option<ReplyTo>,
    pub metadata: Option<Value>,
    pub timestamp: i64,
}

impl NewMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        role: Role,
        kind: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role,
            kind,
            content: content.into(),
            reply_to: None,
            metadata: None,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn text(
        conversation_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self::new(conversation_id, role, MessageType::Text, content)
    }

    pub fn system(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::System, MessageType::System, content)
    }

    pub fn with_reply(mut self, reply_to: Option<ReplyTo>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn into_message(self, id: i64) -> Message {
        Message {
            id,
            conversation_id: self.conversation_id,
            role: self.role,
            kind: self.kind,
            content: self.content,
            reply_to: self.reply_to,
            metadata: self.metadata,
            timestamp: self.timestamp,
        }
    }
}

/// One day of conversation condensed by the archival pipeline. Never edited after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryFragment {
    pub id: String,
    pub conversation_id: String,
    /// Calendar day, `YYYY-MM-DD`.
    pub date: String,
    pub summary: String,
    pub mood: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub due_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub conversation_id: String,
    pub title: String,
    pub date: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveTemplate {
    pub id: i64,
    pub name: String,
    pub template: String,
}

pub const DEFAULT_ARCHIVE_TEMPLATE: &str = "You are {{char}}, keeping a private diary about your time with {{user}}.\n\
Below is everything the two of you said to each other on {{date}}.\n\
Write one diary entry (under 200 words, first person, as {{char}}) capturing what happened, \
what {{user}} shared, and how the day felt. Keep concrete details like plans, names and promises.\n\n\
Conversation log:\n{{log}}";

impl ArchiveTemplate {
    pub fn has_log_placeholder(&self) -> bool {
        self.template.contains("{{log}}")
    }

    pub fn render(&self, date: &str, user: &str, character: &str, log: &str) -> String {
        // Log goes last so that placeholder-like text inside messages is left alone.
        self.template
            .replace("{{date}}", date)
            .replace("{{user}}", user)
            .replace("{{char}}", character)
            .replace("{{log}}", log)
    }
}
