//! One generation turn, end to end: context → generation → recall → directives →
//! segmentation → paced delivery.
//!
//! A turn for a conversation must not overlap another turn for the same conversation;
//! callers keep turns single-flight.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::context::{ContextSettings, ConversationContext};
use crate::delivery::{DeliveryPacing, DeliveryRequest, DeliveryScheduler};
use crate::directives::{Directive, DirectiveContext, DirectiveParser};
use crate::llm::{GenerationOptions, Generator};
use crate::model::{Message, NewMessage, ReplyTo, Role};
use crate::recall::RecallEscalation;
use crate::segmenter::{segment, EmojiCatalog};
use crate::store::{MemoryStore, MessageStore};
use crate::Services;

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub context: ContextSettings,
    pub options: GenerationOptions,
    pub pacing: DeliveryPacing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The backend failed; `notice` is the system message recording it.
    Failed { error: String, notice: Message },
    Delivered {
        /// Messages persisted by directives (pokes, transfers, calendar notes).
        actions: Vec<Message>,
        /// Paced text and emoji messages, in delivery order.
        delivered: Vec<Message>,
        directives: Vec<Directive>,
        escalated: bool,
    },
}

pub struct TurnRunner {
    generator: Arc<dyn Generator>,
    messages: Arc<dyn MessageStore>,
    memory: Arc<dyn MemoryStore>,
    recall: RecallEscalation,
    parser: DirectiveParser,
    delivery: DeliveryScheduler,
    emojis: EmojiCatalog,
    settings: TurnSettings,
}

impl TurnRunner {
    pub fn new(
        services: &Services,
        settings: TurnSettings,
        emojis: EmojiCatalog,
        outbox: Option<mpsc::UnboundedSender<Message>>,
    ) -> Self {
        Self {
            generator: services.generator.clone(),
            messages: services.messages.clone(),
            memory: services.memory.clone(),
            recall: RecallEscalation::new(
                services.generator.clone(),
                services.memory.clone(),
                services.notifier.clone(),
                settings.options,
            ),
            parser: DirectiveParser::new(
                services.messages.clone(),
                services.agenda.clone(),
                services.notifier.clone(),
            ),
            delivery: DeliveryScheduler::new(services.messages.clone(), settings.pacing, outbox),
            emojis,
            settings,
        }
    }

    /// Records a message from the human participant and publishes it.
    pub async fn send_user_message(
        &self,
        conversation_id: &str,
        content: &str,
        reply_to: Option<ReplyTo>,
    ) -> anyhow::Result<Message> {
        let message = self
            .messages
            .insert_message(
                NewMessage::text(conversation_id, Role::User, content).with_reply(reply_to),
            )
            .await?;
        self.delivery.publish(&message);
        Ok(message)
    }

    /// Store failures propagate; generation failures become a recorded notice.
    pub async fn run_turn(&self, conversation_id: &str) -> anyhow::Result<TurnOutcome> {
        let history = self.messages.fetch_history(conversation_id).await?;
        let fragments = self.memory.list_fragments(conversation_id).await?;
        let turns =
            ConversationContext::build(&self.settings.context, &history, &fragments, Utc::now());

        info!(
            "Turn: generating for {} ({} context turns)",
            conversation_id,
            turns.len()
        );

        let generation = match self.generator.generate(&turns, self.settings.options).await {
            Ok(generation) => generation,
            Err(e) => {
                warn!("Turn: generation failed for {}: {}", conversation_id, e);
                let error = e.to_string();
                let notice = self
                    .messages
                    .insert_message(
                        NewMessage::system(conversation_id, format!("Reply failed: {error}"))
                            .with_metadata(json!({ "error": error })),
                    )
                    .await?;
                self.delivery.publish(&notice);
                return Ok(TurnOutcome::Failed { error, notice });
            }
        };

        let outcome = self
            .recall
            .resolve(conversation_id, &turns, generation.text)
            .await;

        let parsed = self
            .parser
            .parse(
                outcome.text(),
                &DirectiveContext {
                    conversation_id,
                    display_name: &self.settings.context.character_name,
                    now: Utc::now(),
                },
            )
            .await?;
        for message in &parsed.messages {
            self.delivery.publish(message);
        }

        let units = segment(&parsed.text, &self.emojis);
        let delivered = self
            .delivery
            .deliver(DeliveryRequest {
                conversation_id,
                user_name: &self.settings.context.user_name,
                history: &history,
                source_text: &parsed.text,
                units,
            })
            .await?;

        info!(
            "Turn: delivered {} message(s) and {} directive(s) in {}",
            delivered.len(),
            parsed.executed.len(),
            conversation_id
        );

        Ok(TurnOutcome::Delivered {
            actions: parsed.messages,
            delivered,
            directives: parsed.executed,
            escalated: outcome.is_escalated(),
        })
    }
}
