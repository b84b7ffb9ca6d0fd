use rusqlite::Connection;

use crate::error::Result;

/// Initializes the schema (spec §6 "Persisted state layout").
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            session_id    TEXT PRIMARY KEY,
            title         TEXT,
            title_source  TEXT NOT NULL DEFAULT 'auto',
            saved         INTEGER NOT NULL DEFAULT 0,
            timezone      TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id    TEXT NOT NULL REFERENCES conversations(session_id),
            role          TEXT NOT NULL,
            content       TEXT NOT NULL,
            parent_id     INTEGER,
            tool_call_id  TEXT,
            tool_name     TEXT,
            tool_calls    TEXT,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, id);

        CREATE TABLE IF NOT EXISTS attachments (
            attachment_id       TEXT PRIMARY KEY,
            session_id          TEXT NOT NULL,
            blob_key            TEXT NOT NULL,
            mime_type           TEXT NOT NULL,
            size_bytes          INTEGER NOT NULL,
            signed_url          TEXT NOT NULL,
            signed_url_expires_at TEXT NOT NULL,
            created_at          TEXT NOT NULL,
            deleted             INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_attachments_session
            ON attachments(session_id);",
    )?;
    Ok(())
}
