/// Idempotent schema applied by `Database::execute_init`.
pub const SCHEMA: &str = "
    -- Conversation messages, append-only apart from explicit edit/delete
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL,
        role TEXT NOT NULL,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        reply_to TEXT,
        metadata TEXT,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id, id);

    -- Archived day summaries; seq keeps append order
    CREATE TABLE IF NOT EXISTS memory_fragments (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        conversation_id TEXT NOT NULL,
        date TEXT NOT NULL,
        summary TEXT NOT NULL,
        mood TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_fragments_conversation ON memory_fragments (conversation_id, seq);

    CREATE TABLE IF NOT EXISTS scheduled_messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        content TEXT NOT NULL,
        due_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_scheduled_due ON scheduled_messages (due_at);

    CREATE TABLE IF NOT EXISTS calendar_events (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        title TEXT NOT NULL,
        date TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS archive_templates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        template TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS emojis (
        name TEXT PRIMARY KEY,
        resource TEXT NOT NULL
    );
";
