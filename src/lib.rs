pub mod archive;
pub mod config;
pub mod context;
pub mod db;
pub mod delivery;
pub mod directives;
pub mod error;
pub mod llm;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod recall;
pub mod reminders;
pub mod segmenter;
pub mod store;
pub mod system_prompt;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

/// Shared collaborators handed to every pipeline stage
#[derive(Clone)]
pub struct Services {
    pub generator: Arc<dyn llm::Generator>,
    pub messages: Arc<dyn store::MessageStore>,
    pub memory: Arc<dyn store::MemoryStore>,
    pub agenda: Arc<dyn store::AgendaStore>,
    pub notifier: Arc<dyn store::Notifier>,
}

impl Services {
    /// Wires every store capability to one SQLite database.
    pub fn with_database(
        db: db::Database,
        generator: Arc<dyn llm::Generator>,
        notifier: Arc<dyn store::Notifier>,
    ) -> Self {
        let db = Arc::new(db);
        Self {
            generator,
            messages: db.clone(),
            memory: db.clone(),
            agenda: db,
            notifier,
        }
    }
}
