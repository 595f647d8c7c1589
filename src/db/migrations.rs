use rusqlite::Connection;

use crate::error::AppError;

/// Create the chat-session schema. Every statement is idempotent, so this
/// runs on every process start.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Chat Sessions
-- ============================================================================

CREATE TABLE IF NOT EXISTS chat_sessions (
    id          TEXT PRIMARY KEY,
    title       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chat_sessions_created ON chat_sessions(created_at);

-- ============================================================================
-- Chat Messages (ordered by explicit position within a session)
-- ============================================================================

CREATE TABLE IF NOT EXISTS chat_messages (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
    position    INTEGER NOT NULL,
    role        TEXT NOT NULL,
    text        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE (session_id, position)
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id, position);
"#;

/// Additive column migrations for databases created by older builds.
pub fn run_incremental(conn: &Connection) -> Result<(), AppError> {
    // Optional author name on messages (tool and multi-agent turns)
    if !has_column(conn, "chat_messages", "author_name")? {
        conn.execute_batch("ALTER TABLE chat_messages ADD COLUMN author_name TEXT;")?;
        tracing::info!("Added author_name column to chat_messages");
    }

    // Open-ended property bag, stored as a JSON object
    if !has_column(conn, "chat_messages", "properties")? {
        conn.execute_batch(
            "ALTER TABLE chat_messages ADD COLUMN properties TEXT NOT NULL DEFAULT '{}';",
        )?;
        tracing::info!("Added properties column to chat_messages");
    }

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, AppError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        rusqlite::params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
