//! Day-by-day condensation of conversation history into memory fragments.
//!
//! History is bucketed by local calendar day and each bucket becomes one generation
//! request. The run stops at the first failing day; fragments produced before it are
//! still appended, so a later run can pick up from the failing date by moving the
//! history-start cutoff.

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::llm::{ChatTurn, GenerationOptions, Generator};
use crate::model::{ArchiveTemplate, MemoryFragment, Message, MessageType, Role, ARCHIVE_MOOD};
use crate::store::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveSettings {
    /// Messages on days before this are ignored.
    pub history_start: Option<NaiveDate>,
    /// Pause between two bucket requests.
    pub pacing: Duration,
    /// Offset used to derive calendar days; the host's local zone when `None`.
    pub offset: Option<FixedOffset>,
    pub options: GenerationOptions,
}

/// Display names substituted into the template and the log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participants {
    pub user: String,
    pub character: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFailure {
    pub date: NaiveDate,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Day buckets left after the cutoff.
    pub requested: usize,
    /// Buckets that produced a fragment.
    pub processed: usize,
    pub fragments: Vec<MemoryFragment>,
    pub failure: Option<ArchiveFailure>,
}

impl ArchiveReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct ArchivePipeline {
    generator: Arc<dyn Generator>,
    memory: Arc<dyn MemoryStore>,
    settings: ArchiveSettings,
}

impl ArchivePipeline {
    pub fn new(
        generator: Arc<dyn Generator>,
        memory: Arc<dyn MemoryStore>,
        settings: ArchiveSettings,
    ) -> Self {
        Self {
            generator,
            memory,
            settings,
        }
    }

    pub async fn run(
        &self,
        conversation_id: &str,
        history: &[Message],
        template: &ArchiveTemplate,
        participants: &Participants,
    ) -> anyhow::Result<ArchiveReport> {
        if !template.has_log_placeholder() {
            return Err(PipelineError::InvalidTemplate(template.name.clone()).into());
        }

        let buckets = self.partition(history);
        let requested = buckets.len();
        info!(
            "Archive: {} day(s) to condense for {}",
            requested, conversation_id
        );

        let mut fragments = Vec::new();
        let mut failure = None;

        for (index, (date, messages)) in buckets.into_iter().enumerate() {
            if index > 0 && !self.settings.pacing.is_zero() {
                tokio::time::sleep(self.settings.pacing).await;
            }

            let day = date.format("%Y-%m-%d").to_string();
            let log = self.render_log(&messages, participants);
            let prompt = template.render(&day, &participants.user, &participants.character, &log);

            match self.condense(prompt).await {
                Ok(summary) => {
                    info!("Archive: condensed {} ({} messages)", day, messages.len());
                    fragments.push(MemoryFragment {
                        id: uuid::Uuid::new_v4().to_string(),
                        conversation_id: conversation_id.to_string(),
                        date: day,
                        summary,
                        mood: ARCHIVE_MOOD.to_string(),
                        created_at: Utc::now().timestamp(),
                    });
                }
                Err(e) => {
                    warn!("Archive: stopped at {}: {}", day, e);
                    failure = Some(ArchiveFailure {
                        date,
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }

        if !fragments.is_empty() {
            self.memory
                .append_fragments(conversation_id, &fragments)
                .await?;
        }

        Ok(ArchiveReport {
            requested,
            processed: fragments.len(),
            fragments,
            failure,
        })
    }

    async fn condense(&self, prompt: String) -> anyhow::Result<String> {
        let generation = self
            .generator
            .generate(&[ChatTurn::user(prompt)], self.settings.options)
            .await?;
        let summary = generation.text.trim();
        if summary.is_empty() {
            return Err(PipelineError::Generation("empty summary".to_string()).into());
        }
        Ok(summary.to_string())
    }

    /// Groups messages by calendar day, dropping days before the cutoff.
    fn partition<'m>(&self, history: &'m [Message]) -> BTreeMap<NaiveDate, Vec<&'m Message>> {
        let mut buckets: BTreeMap<NaiveDate, Vec<&Message>> = BTreeMap::new();
        for message in history {
            let Some(date) = self.local_date(message.timestamp) else {
                continue;
            };
            if self.settings.history_start.is_some_and(|start| date < start) {
                continue;
            }
            buckets.entry(date).or_default().push(message);
        }
        buckets
    }

    fn local_date(&self, timestamp: i64) -> Option<NaiveDate> {
        self.local_time(timestamp).map(|(date, _)| date)
    }

    fn local_time(&self, timestamp: i64) -> Option<(NaiveDate, String)> {
        let utc = DateTime::<Utc>::from_timestamp(timestamp, 0)?;
        let local = match self.settings.offset {
            Some(offset) => utc.with_timezone(&offset).naive_local(),
            None => utc.with_timezone(&Local).naive_local(),
        };
        Some((local.date(), local.format("%H:%M").to_string()))
    }

    fn render_log(&self, messages: &[&Message], participants: &Participants) -> String {
        messages
            .iter()
            .map(|message| {
                let time = self
                    .local_time(message.timestamp)
                    .map(|(_, time)| time)
                    .unwrap_or_default();
                let speaker = match message.role {
                    Role::User => participants.user.as_str(),
                    Role::Assistant => participants.character.as_str(),
                    Role::System => "System",
                };
                let content = match message.kind {
                    MessageType::Text => message.content.as_str(),
                    other => other.marker(),
                };
                format!("[{time}] {speaker}: {content}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
