//! Extraction and execution of the action tags a generation may embed in its text.
//!
//! Each tag kind is an independent, pure [`Extractor`]: it removes every match from the
//! text and reports the directives it found. The [`DirectiveParser`] runs the extractors in
//! a fixed priority order and then executes the collected directives once each. Because
//! every matched tag is stripped, feeding the parser its own output never repeats an
//! effect. Text that only looks like a tag (`[[ACTION:TRANSFER:lots]]`) does not match and
//! is left where it is.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::{Captures, Regex};
use serde_json::json;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::model::{CalendarEvent, Message, MessageType, NewMessage, Role, ScheduledMessage};
use crate::recall::RecallPeriod;
use crate::store::{AgendaStore, MessageStore, Notifier};

static POKE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[ACTION:POKE\]\]").expect("poke pattern is valid"));

static TRANSFER_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[ACTION:TRANSFER:(\d+)\]\]").expect("transfer pattern is valid")
});

static ADD_EVENT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[ACTION:ADD_EVENT\s*\|([^|\]]*)\|([^|\]]*)\]\]")
        .expect("add event pattern is valid")
});

static SCHEDULE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[schedule_message\s*\|([^|\]]*)\|\s*fixed\s*\|([^\]]*)\]")
        .expect("schedule pattern is valid")
});

static RECALL_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[RECALL:\s*(\d{4})\s*(?:-|/|年)\s*(\d{1,2})\s*月?\s*\]\]")
        .expect("recall pattern is valid")
});

/// Naive schedule times are read in the local time zone.
const NAIVE_SCHEDULE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Poke,
    Transfer { amount: String },
    AddEvent { title: String, date: String },
    ScheduleMessage { at: String, content: String },
    Recall { period: RecallPeriod },
}

impl Directive {
    pub fn kind(&self) -> &'static str {
        match self {
            Directive::Poke => "poke",
            Directive::Transfer { .. } => "transfer",
            Directive::AddEvent { .. } => "add_event",
            Directive::ScheduleMessage { .. } => "schedule_message",
            Directive::Recall { .. } => "recall",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
    pub directives: Vec<Directive>,
}

/// One tag kind: a pattern plus a constructor for its captures.
pub struct Extractor {
    name: &'static str,
    pattern: &'static Regex,
    build: fn(&Captures<'_>) -> Option<Directive>,
}

impl Extractor {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Strips every match. A match whose captures do not form a directive is kept verbatim.
    pub fn extract(&self, text: &str) -> Extraction {
        let mut directives = Vec::new();
        let stripped = self.pattern.replace_all(text, |caps: &Captures<'_>| {
            match (self.build)(caps) {
                Some(directive) => {
                    directives.push(directive);
                    String::new()
                }
                None => caps[0].to_string(),
            }
        });
        Extraction {
            text: stripped.into_owned(),
            directives,
        }
    }
}

/// Extractors in priority order.
pub fn default_extractors() -> Vec<Extractor> {
    vec![
        Extractor {
            name: "poke",
            pattern: &POKE_TAG,
            build: |_| Some(Directive::Poke),
        },
        Extractor {
            name: "transfer",
            pattern: &TRANSFER_TAG,
            build: |caps| {
                Some(Directive::Transfer {
                    amount: caps[1].to_string(),
                })
            },
        },
        Extractor {
            name: "add_event",
            pattern: &ADD_EVENT_TAG,
            build: |caps| {
                Some(Directive::AddEvent {
                    title: caps[1].trim().to_string(),
                    date: caps[2].trim().to_string(),
                })
            },
        },
        Extractor {
            name: "schedule_message",
            pattern: &SCHEDULE_TAG,
            build: |caps| {
                Some(Directive::ScheduleMessage {
                    at: caps[1].trim().to_string(),
                    content: caps[2].trim().to_string(),
                })
            },
        },
        Extractor {
            name: "recall",
            pattern: &RECALL_TAG,
            build: |caps| {
                RecallPeriod::from_parts(&caps[1], &caps[2])
                    .map(|period| Directive::Recall { period })
            },
        },
    ]
}

/// Per-turn execution context.
#[derive(Debug, Clone, Copy)]
pub struct DirectiveContext<'a> {
    pub conversation_id: &'a str,
    /// Name the assistant speaks as; used in alerts and log lines.
    pub display_name: &'a str,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    /// The text with every recognized tag removed. May be empty.
    pub text: String,
    /// Directives whose side effect actually ran.
    pub executed: Vec<Directive>,
    /// Messages persisted as side effects, in execution order.
    pub messages: Vec<Message>,
}

pub struct DirectiveParser {
    extractors: Vec<Extractor>,
    messages: Arc<dyn MessageStore>,
    agenda: Arc<dyn AgendaStore>,
    notifier: Arc<dyn Notifier>,
}

impl DirectiveParser {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        agenda: Arc<dyn AgendaStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            extractors: default_extractors(),
            messages,
            agenda,
            notifier,
        }
    }

    /// Pure. Runs the extractor chain until a full pass matches nothing, so stripping
    /// one tag can never leave a newly joined tag behind, then trims the remainder.
    pub fn extract(&self, raw: &str) -> Extraction {
        let mut text = raw.to_string();
        let mut directives = Vec::new();
        loop {
            let found = directives.len();
            for extractor in &self.extractors {
                let extraction = extractor.extract(&text);
                if !extraction.directives.is_empty() {
                    debug!(
                        "Directives: {} matched {} time(s)",
                        extractor.name(),
                        extraction.directives.len()
                    );
                }
                text = extraction.text;
                directives.extend(extraction.directives);
            }
            // Every productive pass shortens the text, so this terminates.
            if directives.len() == found {
                break;
            }
        }
        Extraction {
            text: text.trim().to_string(),
            directives,
        }
    }

    pub async fn parse(
        &self,
        raw: &str,
        ctx: &DirectiveContext<'_>,
    ) -> anyhow::Result<ParsedResponse> {
        let extraction = self.extract(raw);
        let mut executed = Vec::new();
        let mut messages = Vec::new();

        for directive in extraction.directives {
            if self.execute(&directive, ctx, &mut messages).await? {
                executed.push(directive);
            }
        }

        Ok(ParsedResponse {
            text: extraction.text,
            executed,
            messages,
        })
    }

    /// Returns whether a side effect ran. Store failures propagate; notifier failures do not.
    async fn execute(
        &self,
        directive: &Directive,
        ctx: &DirectiveContext<'_>,
        persisted: &mut Vec<Message>,
    ) -> anyhow::Result<bool> {
        let timestamp = ctx.now.timestamp();
        match directive {
            Directive::Poke => {
                let message = self
                    .messages
                    .insert_message(
                        NewMessage::new(
                            ctx.conversation_id,
                            Role::Assistant,
                            MessageType::Interaction,
                            format!("{} poked you", ctx.display_name),
                        )
                        .with_metadata(json!({ "action": "poke" }))
                        .at(timestamp),
                    )
                    .await?;
                persisted.push(message);
                Ok(true)
            }
            Directive::Transfer { amount } => {
                let message = self
                    .messages
                    .insert_message(
                        NewMessage::new(
                            ctx.conversation_id,
                            Role::Assistant,
                            MessageType::Transfer,
                            amount.clone(),
                        )
                        .with_metadata(json!({ "amount": amount, "from": ctx.display_name }))
                        .at(timestamp),
                    )
                    .await?;
                persisted.push(message);
                Ok(true)
            }
            Directive::AddEvent { title, date } => {
                if title.is_empty() || date.is_empty() {
                    debug!("Directives: add_event without title or date ignored");
                    return Ok(false);
                }
                let event = CalendarEvent {
                    id: uuid::Uuid::new_v4().to_string(),
                    conversation_id: ctx.conversation_id.to_string(),
                    title: title.clone(),
                    date: date.clone(),
                    created_at: timestamp,
                };
                self.agenda.upsert_calendar_event(&event).await?;

                let note = format!(
                    "{} added \"{}\" to the calendar on {}",
                    ctx.display_name, title, date
                );
                let message = self
                    .messages
                    .insert_message(
                        NewMessage::system(ctx.conversation_id, note.clone())
                            .with_metadata(json!({ "event_id": event.id }))
                            .at(timestamp),
                    )
                    .await?;
                persisted.push(message);
                self.notifier.toast(&note);
                info!("Directives: calendar event '{}' added for {}", title, date);
                Ok(true)
            }
            Directive::ScheduleMessage { at, content } => {
                let Some(due) = parse_schedule_time(at, ctx.now) else {
                    debug!("Directives: dropped schedule_message with unusable time '{}'", at);
                    return Ok(false);
                };
                if content.is_empty() {
                    debug!("Directives: dropped empty schedule_message");
                    return Ok(false);
                }
                let scheduled = ScheduledMessage {
                    id: uuid::Uuid::new_v4().to_string(),
                    conversation_id: ctx.conversation_id.to_string(),
                    content: content.clone(),
                    due_at: due.timestamp(),
                    created_at: timestamp,
                };
                self.agenda.upsert_scheduled_message(&scheduled).await?;

                if let Err(e) = self
                    .notifier
                    .schedule_alert(ctx.display_name, content, due)
                    .await
                {
                    warn!(
                        "Directives: host alert for scheduled message {} failed: {}",
                        scheduled.id, e
                    );
                }
                info!("Directives: scheduled message {} for {}", scheduled.id, due);
                Ok(true)
            }
            Directive::Recall { period } => {
                // Escalation runs before parsing; by now the marker is only noise.
                debug!("Directives: stripped recall marker for {}", period);
                Ok(false)
            }
        }
    }
}

/// Accepts RFC 3339 or a naive local `YYYY-MM-DD HH:MM[:SS]` (space or `T`).
/// Returns `None` for anything else and for times not strictly after `now`.
pub fn parse_schedule_time(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = text.trim();
    let parsed = DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NAIVE_SCHEDULE_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
                .and_then(|naive| Local.from_local_datetime(&naive).earliest())
                .map(|dt| dt.with_timezone(&Utc))
        })?;
    (parsed > now).then_some(parsed)
}
