//! Conversation context for a generation request.
//!
//! Turns stored history and archived memories into the role/content turns sent to
//! the backend: persona and time first, then memories, then the most recent messages.

use chrono::{DateTime, Utc};

use crate::llm::ChatTurn;
use crate::model::{MemoryFragment, Message, MessageType, Role};
use crate::system_prompt::{build_persona_message, datetime_context_at};

/// Inputs that shape the context besides the stored data itself.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub system_prompt: String,
    pub character_name: String,
    pub user_name: String,
    pub message_limit: usize,
    pub fragment_limit: usize,
}

pub struct ConversationContext;

impl ConversationContext {
    /// History must be oldest first; fragments in append order.
    pub fn build(
        settings: &ContextSettings,
        history: &[Message],
        fragments: &[MemoryFragment],
        now: DateTime<Utc>,
    ) -> Vec<ChatTurn> {
        let mut turns = vec![
            ChatTurn::system(build_persona_message(
                &settings.system_prompt,
                &settings.character_name,
                &settings.user_name,
            )),
            ChatTurn::system(datetime_context_at(now)),
        ];

        // 1. Long-term memory
        let recent_fragments =
            &fragments[fragments.len().saturating_sub(settings.fragment_limit)..];
        if !recent_fragments.is_empty() {
            let mut note = String::from("Your recent diary entries about your time together:\n");
            for fragment in recent_fragments {
                note.push_str(&format!("- {}: {}\n", fragment.date, fragment.summary.trim()));
            }
            turns.push(ChatTurn::system(note.trim_end()));
        }

        // 2. Short-term context (verbatim messages)
        let recent = &history[history.len().saturating_sub(settings.message_limit)..];
        turns.extend(recent.iter().filter_map(Self::format_message));
        turns
    }

    fn format_message(message: &Message) -> Option<ChatTurn> {
        let body = match message.kind {
            MessageType::Text | MessageType::System => message.content.trim().to_string(),
            MessageType::Transfer => format!("{} {}", message.kind.marker(), message.content),
            other => other.marker().to_string(),
        };
        if body.is_empty() {
            return None;
        }

        let body = match &message.reply_to {
            Some(reply) => format!("(replying to {}: \"{}\") {}", reply.name, reply.content, body),
            None => body,
        };

        Some(match message.role {
            Role::User => ChatTurn::user(body),
            Role::Assistant => ChatTurn::assistant(body),
            Role::System => ChatTurn::system(format!("[Notice] {body}")),
        })
    }
}
