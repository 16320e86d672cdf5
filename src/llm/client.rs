use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{ChatTurn, Generation, GenerationOptions, Generator, TokenUsage};
use crate::config::Config;
use crate::error::PipelineError;
use crate::model::Role;

/// OpenAI-compatible chat-completions backend (llama.cpp, vLLM, hosted APIs).
pub struct LlmClient {
    chat_client: Client<OpenAIConfig>,
    chat_model: String,
}

impl LlmClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut chat_config = OpenAIConfig::new().with_api_base(&config.llm_url);

        if let Some(key) = &config.llm_api_key {
            chat_config = chat_config.with_api_key(key);
        } else {
            chat_config = chat_config.with_api_key("unused");
        }

        // The transport timeout is the only deadline a generation request gets.
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm_timeout_secs))
            .build()?;

        Ok(Self {
            chat_client: Client::with_config(chat_config).with_http_client(http_client),
            chat_model: config.llm_model.clone(),
        })
    }

    fn build_messages(turns: &[ChatTurn]) -> anyhow::Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages = Vec::with_capacity(turns.len());
        for turn in turns {
            let message: ChatCompletionRequestMessage = match turn.role {
                Role::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(turn.content.clone())
                    .build()?
                    .into(),
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content.clone())
                    .build()?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content.clone())
                    .build()?
                    .into(),
            };
            messages.push(message);
        }
        Ok(messages)
    }
}

#[async_trait]
impl Generator for LlmClient {
    async fn generate(
        &self,
        turns: &[ChatTurn],
        options: GenerationOptions,
    ) -> anyhow::Result<Generation> {
        #[allow(deprecated)]
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.chat_model)
            .messages(Self::build_messages(turns)?)
            .temperature(options.temperature)
            .max_tokens(options.max_tokens)
            .stream(false)
            .build()?;

        let response = self.chat_client.chat().create(request).await?;

        let text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| {
                PipelineError::Generation("response carried no message content".to_string())
            })?;

        let usage = response.usage.map(|usage| TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        });
        if let Some(usage) = &usage {
            debug!(
                "LLM usage: prompt={} completion={} total={}",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }

        Ok(Generation { text, usage })
    }
}
