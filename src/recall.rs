//! Recall escalation: a second generation round fed with archived memories.
//!
//! The first generation may ask for older memories by emitting `[[RECALL:2024-03]]`.
//! The flow has exactly two exits, modelled by [`RecallOutcome`]: `Direct` keeps the
//! first output (marker stripped), `Escalated` replaces it with the output of a second
//! call that saw the matching memory fragments.

use regex::{Captures, Regex};
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

use crate::llm::{ChatTurn, GenerationOptions, Generator};
use crate::model::MemoryFragment;
use crate::store::{MemoryStore, Notifier};

/// Bracketed or bare `RECALL:<year>-<month>`, also `2024/3` and `2024年3月`.
static RECALL_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\[\[)?RECALL:\s*(\d{4})\s*(?:-|/|年)\s*(\d{1,2})\s*月?\s*(?:\]\])?")
        .expect("recall marker pattern is valid")
});

static DATE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{4})\s*(?:-|/|年)\s*(\d{1,2})").expect("date prefix pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecallPeriod {
    pub year: i32,
    pub month: u32,
}

impl RecallPeriod {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    /// Parses the numeric year/month captures of a recall marker.
    pub(crate) fn from_parts(year: &str, month: &str) -> Option<Self> {
        Self::new(year.parse().ok()?, month.parse().ok()?)
    }

    /// Whether a fragment date (`2024-03-07`, `2024/3/7`, `2024年3月7日`) falls in this month.
    pub fn matches(&self, date: &str) -> bool {
        DATE_PREFIX
            .captures(date)
            .and_then(|caps| Self::from_parts(&caps[1], &caps[2]))
            .is_some_and(|period| period == *self)
    }
}

impl fmt::Display for RecallPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// First well-formed recall marker in `text`.
pub fn find_marker(text: &str) -> Option<RecallPeriod> {
    RECALL_MARKER
        .captures_iter(text)
        .find_map(|caps| RecallPeriod::from_parts(&caps[1], &caps[2]))
}

/// Removes every well-formed recall marker. Markers with an impossible month stay,
/// matching what [`find_marker`] ignores.
pub fn strip_markers(text: &str) -> String {
    RECALL_MARKER
        .replace_all(text, |caps: &Captures<'_>| {
            match RecallPeriod::from_parts(&caps[1], &caps[2]) {
                Some(_) => String::new(),
                None => caps[0].to_string(),
            }
        })
        .trim()
        .to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecallOutcome {
    Direct {
        text: String,
    },
    Escalated {
        period: RecallPeriod,
        fragments: Vec<MemoryFragment>,
        text: String,
    },
}

impl RecallOutcome {
    pub fn text(&self) -> &str {
        match self {
            RecallOutcome::Direct { text } | RecallOutcome::Escalated { text, .. } => text,
        }
    }

    pub fn is_escalated(&self) -> bool {
        matches!(self, RecallOutcome::Escalated { .. })
    }
}

pub struct RecallEscalation {
    generator: Arc<dyn Generator>,
    memory: Arc<dyn MemoryStore>,
    notifier: Arc<dyn Notifier>,
    options: GenerationOptions,
}

impl RecallEscalation {
    pub fn new(
        generator: Arc<dyn Generator>,
        memory: Arc<dyn MemoryStore>,
        notifier: Arc<dyn Notifier>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            generator,
            memory,
            notifier,
            options,
        }
    }

    /// Decides which generation output reaches the directive parser. Never fails:
    /// every problem on the escalated path falls back to the first output.
    pub async fn resolve(
        &self,
        conversation_id: &str,
        context: &[ChatTurn],
        first_output: String,
    ) -> RecallOutcome {
        let Some(period) = find_marker(&first_output) else {
            return RecallOutcome::Direct { text: first_output };
        };
        let stripped = strip_markers(&first_output);

        self.notifier
            .status(&format!("Looking back on memories from {period}…"));

        let listed = self.memory.list_fragments(conversation_id).await;
        let fragments: Vec<MemoryFragment> = match listed {
            Ok(all) => all.into_iter().filter(|f| period.matches(&f.date)).collect(),
            Err(e) => {
                warn!("Recall: failed to load memory fragments for {}: {}", conversation_id, e);
                return RecallOutcome::Direct { text: stripped };
            }
        };

        if fragments.is_empty() {
            info!("Recall: no memories archived for {} in {}", period, conversation_id);
            return RecallOutcome::Direct { text: stripped };
        }

        let mut turns = context.to_vec();
        turns.push(ChatTurn::system(recall_note(period, &fragments)));

        match self.generator.generate(&turns, self.options).await {
            Ok(generation) => {
                info!(
                    "Recall: escalated with {} fragments from {} in {}",
                    fragments.len(),
                    period,
                    conversation_id
                );
                RecallOutcome::Escalated {
                    period,
                    fragments,
                    // A second marker is not honoured; one escalation per turn.
                    text: strip_markers(&generation.text),
                }
            }
            Err(e) => {
                warn!("Recall: escalation request failed, keeping first reply: {}", e);
                RecallOutcome::Direct { text: stripped }
            }
        }
    }
}

fn recall_note(period: RecallPeriod, fragments: &[MemoryFragment]) -> String {
    let mut note = format!(
        "[Memory recall] You looked back on {period}. These are your own diary entries from that time:\n"
    );
    for fragment in fragments {
        note.push_str(&format!(
            "- {} ({}): {}\n",
            fragment.date,
            fragment.mood,
            fragment.summary.trim()
        ));
    }
    note.push_str(
        "Use these memories naturally in your reply, the way a person recalls something. \
Do not mention diaries, archives, tags or this note, and do not ask to recall again.",
    );
    note
}
