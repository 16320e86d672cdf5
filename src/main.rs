use anyhow::Context as _;
use clap::{Parser, Subcommand};
use confidant::archive::{ArchivePipeline, Participants};
use confidant::config::Config;
use confidant::db::Database;
use confidant::error::PipelineError;
use confidant::llm::LlmClient;
use confidant::model::{Message, MessageType, Role};
use confidant::notify::LogNotifier;
use confidant::pipeline::{TurnOutcome, TurnRunner, TurnSettings};
use confidant::reminders::ScheduledDispatcher;
use confidant::Services;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Companion chat with paced delivery and long-term memory.
#[derive(Parser)]
#[command(name = "confidant", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chat in a conversation, one stdin line per message
    Chat { conversation: String },
    /// Condense the conversation history into memory fragments
    Archive {
        conversation: String,
        /// Archive template name
        #[arg(long, default_value = "default")]
        template: String,
    },
    /// Replace the content of a stored message
    Edit { id: i64, content: String },
    /// Delete stored messages by id
    Delete {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Delete every message of a conversation
    Clear { conversation: String },
    /// Register a sticker the character can send
    Emoji { name: String, resource: String },
    /// Create or replace an archive template (must contain {{log}})
    Template { name: String, template: String },
    /// Show pending scheduled messages and calendar events
    Agenda { conversation: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!("Loaded configuration: {:?}", config);

    let db = Database::new(&config)?;
    db.execute_init()?;

    match cli.command {
        Command::Chat { conversation } => chat(config, db, &conversation).await,
        Command::Archive {
            conversation,
            template,
        } => archive(config, db, &conversation, &template).await,
        Command::Edit { id, content } => {
            let updated = db.update_message_content(id, &content)?;
            println!("Updated {updated} message(s)");
            Ok(())
        }
        Command::Delete { ids } => {
            let deleted = db.delete_messages(&ids)?;
            println!("Deleted {deleted} message(s)");
            Ok(())
        }
        Command::Clear { conversation } => {
            let deleted = db.clear_conversation(&conversation)?;
            println!("Cleared {deleted} message(s) from {conversation}");
            Ok(())
        }
        Command::Emoji { name, resource } => {
            db.upsert_emoji(&name, &resource)?;
            println!("Registered sticker '{name}'");
            Ok(())
        }
        Command::Template { name, template } => {
            if !template.contains("{{log}}") {
                return Err(PipelineError::InvalidTemplate(name).into());
            }
            db.save_archive_template(&name, &template)?;
            println!("Saved archive template '{name}'");
            Ok(())
        }
        Command::Agenda { conversation } => {
            for scheduled in db.list_scheduled_messages(&conversation)? {
                let due = chrono::DateTime::from_timestamp(scheduled.due_at, 0)
                    .map(|dt| dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("scheduled {} at {}: {}", scheduled.id, due, scheduled.content);
            }
            for event in db.list_calendar_events(&conversation)? {
                println!("event {} on {}: {}", event.id, event.date, event.title);
            }
            Ok(())
        }
    }
}

async fn chat(config: Config, db: Database, conversation: &str) -> anyhow::Result<()> {
    let generator = Arc::new(LlmClient::new(&config)?);
    let emojis = db.load_emoji_catalog()?;
    if emojis.is_empty() {
        info!("No stickers registered; emoji tags will be dropped");
    } else {
        info!("Loaded {} sticker(s)", emojis.len());
    }
    let services = Services::with_database(db, generator, Arc::new(LogNotifier));

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let settings = TurnSettings {
        context: config.context_settings(),
        options: config.generation_options(),
        pacing: config.delivery_pacing(),
    };
    let runner = TurnRunner::new(&services, settings, emojis, Some(tx.clone()));

    let dispatcher = ScheduledDispatcher::new(
        services.agenda.clone(),
        services.messages.clone(),
        Some(tx),
        config.scheduler_poll_interval_secs,
        config.scheduler_batch_size,
    );
    tokio::spawn(dispatcher.run());

    let character = config.character_name.clone();
    let user = config.user_name.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            println!("{}", render(&message, &character, &user));
        }
    });

    info!("Chatting in '{}' as {}; Ctrl-D to quit", conversation, config.user_name);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        runner.send_user_message(conversation, line, None).await?;
        match runner.run_turn(conversation).await {
            Ok(TurnOutcome::Failed { error, .. }) => error!("Turn failed: {}", error),
            Ok(TurnOutcome::Delivered { .. }) => {}
            Err(e) => error!("Turn aborted: {:#}", e),
        }
    }
    Ok(())
}

async fn archive(
    config: Config,
    db: Database,
    conversation: &str,
    template_name: &str,
) -> anyhow::Result<()> {
    let template = db
        .get_archive_template(template_name)?
        .ok_or_else(|| PipelineError::TemplateNotFound(template_name.to_string()))?;
    let history = db
        .fetch_history(conversation)
        .with_context(|| format!("Failed to load history for {conversation}"))?;

    let generator = Arc::new(LlmClient::new(&config)?);
    let pipeline = ArchivePipeline::new(generator, Arc::new(db), config.archive_settings());
    let participants = Participants {
        user: config.user_name.clone(),
        character: config.character_name.clone(),
    };

    let report = pipeline
        .run(conversation, &history, &template, &participants)
        .await?;

    println!(
        "Archived {}/{} day(s) for {}",
        report.processed, report.requested, conversation
    );
    for fragment in &report.fragments {
        println!("  {}: {}", fragment.date, fragment.summary);
    }
    if let Some(failure) = report.failure {
        println!("Stopped at {}: {}", failure.date, failure.error);
        println!("Set ARCHIVE_HISTORY_START={} to resume from there", failure.date);
    }
    Ok(())
}

fn render(message: &Message, character: &str, user: &str) -> String {
    let time = message
        .datetime()
        .map(|dt| dt.with_timezone(&chrono::Local).format("%H:%M").to_string())
        .unwrap_or_default();
    let speaker = match message.role {
        Role::User => user,
        Role::Assistant => character,
        Role::System => "system",
    };
    let body = match message.kind {
        MessageType::Text | MessageType::System => message.content.clone(),
        other => format!("{} {}", other.marker(), message.content),
    };
    let body = match &message.reply_to {
        Some(reply) => format!("> {}: {}\n        {}", reply.name, reply.content, body),
        None => body,
    };
    format!("[{time}] {speaker}: {body}")
}
