//! Human-paced, strictly sequential delivery of segmented units.
//!
//! Each unit waits out its delay, is persisted as a new assistant message, and is then
//! published to the optional outbox channel. Reply quotes (`[[QUOTE: snippet]]`) are
//! resolved against the human side of the visible history and never fail a turn.

use rand::Rng;
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::model::{Message, MessageType, NewMessage, ReplyTo, Role};
use crate::segmenter::DeliveryUnit;
use crate::store::MessageStore;

static QUOTE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[QUOTE:\s*([^\]]*?)\s*\]\]").expect("quote marker pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPacing {
    /// Floor for a text chunk.
    pub min_delay: Duration,
    /// Ceiling for a text chunk.
    pub max_delay: Duration,
    pub per_char: Duration,
    pub emoji_min: Duration,
    pub emoji_max: Duration,
}

impl Default for DeliveryPacing {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(600),
            max_delay: Duration::from_secs(4),
            per_char: Duration::from_millis(80),
            emoji_min: Duration::from_millis(300),
            emoji_max: Duration::from_millis(1200),
        }
    }
}

impl DeliveryPacing {
    /// Typing time for a chunk, clamped to `[min_delay, max_delay]`.
    pub fn text_delay(&self, chunk: &str) -> Duration {
        let chars = u32::try_from(chunk.chars().count()).unwrap_or(u32::MAX);
        self.per_char
            .saturating_mul(chars)
            .max(self.min_delay)
            .min(self.max_delay)
    }

    pub fn emoji_delay<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.emoji_min >= self.emoji_max {
            return self.emoji_min;
        }
        rng.gen_range(self.emoji_min..=self.emoji_max)
    }
}

/// One generation turn's worth of units plus what quote resolution needs.
#[derive(Debug, Clone)]
pub struct DeliveryRequest<'a> {
    pub conversation_id: &'a str,
    /// Name recorded on resolved reply references.
    pub user_name: &'a str,
    /// Visible history as it stood before this turn's generation.
    pub history: &'a [Message],
    /// The text the units were segmented from.
    pub source_text: &'a str,
    pub units: Vec<DeliveryUnit>,
}

pub struct DeliveryScheduler {
    store: Arc<dyn MessageStore>,
    pacing: DeliveryPacing,
    outbox: Option<mpsc::UnboundedSender<Message>>,
}

impl DeliveryScheduler {
    pub fn new(
        store: Arc<dyn MessageStore>,
        pacing: DeliveryPacing,
        outbox: Option<mpsc::UnboundedSender<Message>>,
    ) -> Self {
        Self {
            store,
            pacing,
            outbox,
        }
    }

    /// Hands a persisted message to the host, if one is listening.
    pub fn publish(&self, message: &Message) {
        if let Some(outbox) = &self.outbox {
            if outbox.send(message.clone()).is_err() {
                debug!("Delivery: outbox closed, message {} not published", message.id);
            }
        }
    }

    /// Delivers every unit in order. Runs to completion once started.
    pub async fn deliver(&self, request: DeliveryRequest<'_>) -> anyhow::Result<Vec<Message>> {
        let claimed = request.units.iter().any(|unit| match unit {
            DeliveryUnit::Text(chunk) => QUOTE_MARKER.is_match(chunk),
            DeliveryUnit::Emoji { .. } => false,
        });
        let mut unclaimed = if claimed {
            None
        } else {
            take_quote(request.source_text).0
        };
        let mut carried: Option<String> = None;
        let mut delivered = Vec::with_capacity(request.units.len());

        for unit in request.units {
            let message = match unit {
                DeliveryUnit::Text(chunk) => {
                    let (own, content) = take_quote(&chunk);
                    if content.is_empty() {
                        // a marker on its own applies to whatever is said next
                        if own.is_some() {
                            carried = own;
                        }
                        continue;
                    }
                    let quote = own.or_else(|| carried.take()).or_else(|| unclaimed.take());
                    let reply_to = quote.and_then(|snippet| {
                        resolve_reply(request.history, &snippet, request.user_name)
                    });

                    tokio::time::sleep(self.pacing.text_delay(&content)).await;
                    NewMessage::text(request.conversation_id, Role::Assistant, content)
                        .with_reply(reply_to)
                }
                DeliveryUnit::Emoji { name, resource } => {
                    let delay = self.pacing.emoji_delay(&mut rand::thread_rng());
                    tokio::time::sleep(delay).await;
                    NewMessage::new(
                        request.conversation_id,
                        Role::Assistant,
                        MessageType::Emoji,
                        resource,
                    )
                    .with_metadata(json!({ "name": name }))
                }
            };

            let message = self.store.insert_message(message).await?;
            debug!(
                "Delivery: {} message {} in {}",
                message.kind.as_str(),
                message.id,
                message.conversation_id
            );
            self.publish(&message);
            delivered.push(message);
        }

        if carried.is_some() {
            debug!("Delivery: trailing quote marker had no chunk to attach to");
        }
        Ok(delivered)
    }
}

/// First non-empty quote snippet plus the text with every quote marker removed.
pub fn take_quote(text: &str) -> (Option<String>, String) {
    let snippet = QUOTE_MARKER
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .find(|snippet| !snippet.is_empty());
    let stripped = QUOTE_MARKER.replace_all(text, "").trim().to_string();
    (snippet, stripped)
}

/// Most recent human-authored message containing `snippet`.
pub fn resolve_reply(history: &[Message], snippet: &str, user_name: &str) -> Option<ReplyTo> {
    history
        .iter()
        .rev()
        .filter(|message| message.role == Role::User)
        .find(|message| message.content.contains(snippet))
        .map(|message| ReplyTo {
            id: message.id,
            content: message.content.clone(),
            name: user_name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryStore;
    use rand::{rngs::StdRng, SeedableRng};
    use tokio::time::Instant;

    fn pacing() -> DeliveryPacing {
        DeliveryPacing::default()
    }

    fn history(store: &InMemoryStore) -> Vec<Message> {
        store.seed_message(NewMessage::text("c1", Role::User, "did you see the sunset today?"));
        store.seed_message(NewMessage::text("c1", Role::Assistant, "the sunset was pretty"));
        store.seed_message(NewMessage::text("c1", Role::User, "I'm so tired"));
        store.messages()
    }

    fn text(chunk: &str) -> DeliveryUnit {
        DeliveryUnit::Text(chunk.to_string())
    }

    #[test]
    fn test_text_delay_is_clamped() {
        let pacing = pacing();
        assert_eq!(pacing.text_delay("a"), Duration::from_millis(600));
        assert_eq!(pacing.text_delay("0123456789"), Duration::from_millis(800));
        assert_eq!(pacing.text_delay(&"x".repeat(10_000)), Duration::from_secs(4));
    }

    #[test]
    fn test_emoji_delay_stays_in_range() {
        let pacing = pacing();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let delay = pacing.emoji_delay(&mut rng);
            assert!(delay >= pacing.emoji_min && delay <= pacing.emoji_max);
        }

        let fixed = DeliveryPacing {
            emoji_min: Duration::from_millis(500),
            emoji_max: Duration::from_millis(500),
            ..pacing
        };
        assert_eq!(fixed.emoji_delay(&mut rng), Duration::from_millis(500));
    }

    #[test]
    fn test_resolve_reply_only_matches_human_messages() {
        let store = InMemoryStore::default();
        let history = history(&store);

        let reply = resolve_reply(&history, "sunset", "Ada").unwrap();
        assert_eq!(reply.id, history[0].id);
        assert_eq!(reply.name, "Ada");
        assert_eq!(reply.content, "did you see the sunset today?");

        assert_eq!(resolve_reply(&history, "pretty", "Ada"), None);
        assert_eq!(resolve_reply(&history, "pizza", "Ada"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_units_are_paced_persisted_and_published_in_order() {
        let store = Arc::new(InMemoryStore::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = DeliveryScheduler::new(store.clone(), pacing(), Some(tx));

        let start = Instant::now();
        let delivered = scheduler
            .deliver(DeliveryRequest {
                conversation_id: "c1",
                user_name: "Ada",
                history: &[],
                source_text: "Hi. How was work today?",
                units: vec![
                    text("Hi."),
                    DeliveryUnit::Emoji {
                        name: "smile".to_string(),
                        resource: "stickers/smile.png".to_string(),
                    },
                    text("How was work today?"),
                ],
            })
            .await
            .unwrap();
        let elapsed = start.elapsed();

        // 600ms floor + emoji (300..=1200ms) + 19 chars * 80ms
        assert!(elapsed >= Duration::from_millis(600 + 300 + 1520));
        assert!(elapsed <= Duration::from_millis(600 + 1200 + 1520 + 50));

        let kinds: Vec<_> = delivered.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MessageType::Text, MessageType::Emoji, MessageType::Text]);
        assert_eq!(delivered[1].content, "stickers/smile.png");
        assert_eq!(store.messages(), delivered);

        for expected in &delivered {
            assert_eq!(&rx.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quote_rules() {
        let store = Arc::new(InMemoryStore::default());
        let history = history(&store);
        let scheduler = DeliveryScheduler::new(store.clone(), pacing(), None);

        let delivered = scheduler
            .deliver(DeliveryRequest {
                conversation_id: "c1",
                user_name: "Ada",
                history: &history,
                source_text: "",
                units: vec![
                    text("[[QUOTE: tired]]Then rest early."),
                    text("[[QUOTE: sunset]]"),
                    text("It really was."),
                    text("[[QUOTE: pizza]]Hmm?"),
                    text("Good night."),
                ],
            })
            .await
            .unwrap();

        let contents: Vec<_> = delivered.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["Then rest early.", "It really was.", "Hmm?", "Good night."]
        );
        assert_eq!(delivered[0].reply_to.as_ref().unwrap().id, history[2].id);
        assert_eq!(delivered[1].reply_to.as_ref().unwrap().id, history[0].id);
        assert_eq!(delivered[2].reply_to, None);
        assert_eq!(delivered[3].reply_to, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_source_quote_goes_to_first_text_chunk() {
        let store = Arc::new(InMemoryStore::default());
        let history = history(&store);
        let scheduler = DeliveryScheduler::new(store.clone(), pacing(), None);

        let delivered = scheduler
            .deliver(DeliveryRequest {
                conversation_id: "c1",
                user_name: "Ada",
                history: &history,
                source_text: "[[QUOTE: sunset]]Yes! Gorgeous.",
                units: vec![
                    DeliveryUnit::Emoji {
                        name: "smile".to_string(),
                        resource: "smile.png".to_string(),
                    },
                    text("Yes!"),
                    text("Gorgeous."),
                ],
            })
            .await
            .unwrap();

        assert_eq!(delivered[0].reply_to, None);
        assert_eq!(delivered[1].reply_to.as_ref().unwrap().id, history[0].id);
        assert_eq!(delivered[2].reply_to, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_to_deliver() {
        let store = Arc::new(InMemoryStore::default());
        let scheduler = DeliveryScheduler::new(store.clone(), pacing(), None);

        let delivered = scheduler
            .deliver(DeliveryRequest {
                conversation_id: "c1",
                user_name: "Ada",
                history: &[],
                source_text: "",
                units: vec![text("[[QUOTE: anything]]")],
            })
            .await
            .unwrap();

        assert!(delivered.is_empty());
        assert!(store.messages().is_empty());
    }
}
