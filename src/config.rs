use anyhow::Context as _;
use chrono::NaiveDate;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::archive::ArchiveSettings;
use crate::context::ContextSettings;
use crate::delivery::DeliveryPacing;
use crate::llm::GenerationOptions;

#[derive(Clone)]
pub struct Config {
    pub llm_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_timeout_secs: u64,
    pub database_url: String,
    pub system_prompt: String,
    pub character_name: String,
    pub user_name: String,

    // Context building
    pub context_message_limit: usize,
    pub context_fragment_limit: usize,

    // Delivery pacing
    pub delivery_min_delay: Duration,
    pub delivery_max_delay: Duration,
    pub delivery_per_char_delay: Duration,
    pub emoji_min_delay: Duration,
    pub emoji_max_delay: Duration,

    // Archival
    pub archive_history_start: Option<NaiveDate>,
    pub archive_pacing: Duration,
    pub archive_max_tokens: u32,

    // Scheduled message dispatch
    pub scheduler_poll_interval_secs: u64,
    pub scheduler_batch_size: usize,
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are {{char}}, {{user}}'s close companion. \
You chat like a real person texting a friend: short messages, warm, a little playful, never robotic. \
You have your own moods and opinions, remember what {{user}} tells you, and bring things up again later.";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let config = Config {
            llm_url: env::var("LLM_URL").unwrap_or_else(|_| "http://localhost:8080/v1".to_string()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "local-model".to_string()),
            llm_api_key: env::var("LLM_API_KEY").ok(),
            llm_temperature: env::var("LLM_TEMPERATURE")
                .unwrap_or_else(|_| "0.8".to_string())
                .parse()
                .unwrap_or(0.8),
            llm_max_tokens: env::var("LLM_MAX_TOKENS")
                .unwrap_or_else(|_| "800".to_string())
                .parse()
                .unwrap_or(800),
            llm_timeout_secs: env::var("LLM_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .unwrap_or(120),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/confidant.db".to_string()),
            system_prompt: env::var("SYSTEM_PROMPT")
                .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string()),
            character_name: env::var("CHARACTER_NAME").unwrap_or_else(|_| "Ember".to_string()),
            user_name: env::var("USER_NAME").unwrap_or_else(|_| "You".to_string()),
            context_message_limit: env::var("CONTEXT_MESSAGE_LIMIT")
                .unwrap_or_else(|_| "40".to_string())
                .parse()
                .unwrap_or(40),
            context_fragment_limit: env::var("CONTEXT_FRAGMENT_LIMIT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            delivery_min_delay: duration_var("DELIVERY_MIN_DELAY", "600ms")?,
            delivery_max_delay: duration_var("DELIVERY_MAX_DELAY", "4s")?,
            delivery_per_char_delay: duration_var("DELIVERY_PER_CHAR_DELAY", "80ms")?,
            emoji_min_delay: duration_var("EMOJI_MIN_DELAY", "300ms")?,
            emoji_max_delay: duration_var("EMOJI_MAX_DELAY", "1200ms")?,
            archive_history_start: match env::var("ARCHIVE_HISTORY_START") {
                Ok(raw) if !raw.trim().is_empty() => Some(
                    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                        .map_err(|_| anyhow::anyhow!("ARCHIVE_HISTORY_START must be YYYY-MM-DD"))?,
                ),
                _ => None,
            },
            archive_pacing: duration_var("ARCHIVE_PACING", "2s")?,
            archive_max_tokens: env::var("ARCHIVE_MAX_TOKENS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .unwrap_or(600),
            scheduler_poll_interval_secs: env::var("SCHEDULER_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            scheduler_batch_size: env::var("SCHEDULER_BATCH_SIZE")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
        };

        if config.delivery_min_delay > config.delivery_max_delay {
            anyhow::bail!("DELIVERY_MIN_DELAY must not exceed DELIVERY_MAX_DELAY");
        }
        if config.emoji_min_delay > config.emoji_max_delay {
            anyhow::bail!("EMOJI_MIN_DELAY must not exceed EMOJI_MAX_DELAY");
        }
        Ok(config)
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            temperature: self.llm_temperature,
            max_tokens: self.llm_max_tokens,
        }
    }

    pub fn context_settings(&self) -> ContextSettings {
        ContextSettings {
            system_prompt: self.system_prompt.clone(),
            character_name: self.character_name.clone(),
            user_name: self.user_name.clone(),
            message_limit: self.context_message_limit,
            fragment_limit: self.context_fragment_limit,
        }
    }

    pub fn delivery_pacing(&self) -> DeliveryPacing {
        DeliveryPacing {
            min_delay: self.delivery_min_delay,
            max_delay: self.delivery_max_delay,
            per_char: self.delivery_per_char_delay,
            emoji_min: self.emoji_min_delay,
            emoji_max: self.emoji_max_delay,
        }
    }

    pub fn archive_settings(&self) -> ArchiveSettings {
        ArchiveSettings {
            history_start: self.archive_history_start,
            pacing: self.archive_pacing,
            offset: None,
            options: GenerationOptions {
                // Summaries should be stable rather than creative.
                temperature: self.llm_temperature.min(0.5),
                max_tokens: self.archive_max_tokens,
            },
        }
    }
}

/// Reads a humantime duration (`600ms`, `2s`, `1m 30s`), falling back to `default`.
fn duration_var(key: &str, default: &str) -> anyhow::Result<Duration> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(raw.trim())
        .with_context(|| format!("{key} must be a duration like 500ms or 2s, got '{raw}'"))
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("llm_url", &self.llm_url)
            .field("llm_model", &self.llm_model)
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "[REDACTED]"))
            .field("llm_temperature", &self.llm_temperature)
            .field("llm_max_tokens", &self.llm_max_tokens)
            .field("llm_timeout_secs", &self.llm_timeout_secs)
            .field("database_url", &self.database_url)
            .field("system_prompt", &self.system_prompt)
            .field("character_name", &self.character_name)
            .field("user_name", &self.user_name)
            .field("context_message_limit", &self.context_message_limit)
            .field("context_fragment_limit", &self.context_fragment_limit)
            .field("delivery_min_delay", &self.delivery_min_delay)
            .field("delivery_max_delay", &self.delivery_max_delay)
            .field("delivery_per_char_delay", &self.delivery_per_char_delay)
            .field("emoji_min_delay", &self.emoji_min_delay)
            .field("emoji_max_delay", &self.emoji_max_delay)
            .field("archive_history_start", &self.archive_history_start)
            .field("archive_pacing", &self.archive_pacing)
            .field("archive_max_tokens", &self.archive_max_tokens)
            .field(
                "scheduler_poll_interval_secs",
                &self.scheduler_poll_interval_secs,
            )
            .field("scheduler_batch_size", &self.scheduler_batch_size)
            .finish()
    }
}
