use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::db::init_db;
use crate::error::{RepositoryError, Result};
use crate::types::{
    Attachment, Content, ContentPart, Message, MessageRole, NewMessage, Session, SessionSummary,
    TitleSource, ToolCallRecord,
};

/// Durable store for sessions, messages, and attachments (spec §4.4).
///
/// Grounded in the embedded-SQLite + `Mutex<Connection>` convention this
/// codebase uses throughout its storage crates; the additional per-session
/// `AsyncMutex` generalizes the advisory-lock pattern this codebase uses for
/// in-flight work elsewhere, here keyed by `session_id` to give callers an
/// explicit handle on the "appends are serialized per session" guarantee
/// (spec §5) even though SQLite's own connection mutex already serializes
/// the underlying writes.
pub struct Repository {
    conn: Mutex<Connection>,
    write_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl Repository {
    pub fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            write_locks: DashMap::new(),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            write_locks: DashMap::new(),
        })
    }

    fn lock_for(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        self.write_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Resolves a session, creating it if `session_id` is absent or unknown
    /// (spec §4.1 step 1, idempotent given a client-supplied id).
    #[instrument(skip(self))]
    pub async fn get_or_create_session(
        &self,
        session_id: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<Session> {
        if let Some(id) = session_id {
            if let Some(existing) = self.get_session(id)? {
                return Ok(existing);
            }
        }

        let id = session_id
            .map(String::from)
            .unwrap_or_else(gateway_core::ids::new_id);
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR IGNORE INTO conversations (session_id, title, title_source, saved, timezone, created_at, updated_at)
                 VALUES (?1, NULL, 'auto', 0, ?2, ?3, ?3)",
                params![id, timezone, now],
            )?;
        }

        self.get_session(&id)?
            .ok_or_else(|| RepositoryError::SessionNotFound { id: id.clone() })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT session_id, title, title_source, saved, timezone, created_at, updated_at
             FROM conversations WHERE session_id = ?1",
            params![session_id],
            row_to_session,
        )
        .optional()
        .map_err(RepositoryError::from)
    }

    /// Atomically assigns the next `id` and appends a message (spec §4.4
    /// `append_message`). Auto-titles the session on the first user message.
    #[instrument(skip(self, message))]
    pub async fn append_message(&self, session_id: &str, message: NewMessage) -> Result<Message> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let now = Utc::now().to_rfc3339();
        let content_json = serde_json::to_string(&message.content)?;
        let tool_calls_json = if message.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.tool_calls)?)
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (session_id, role, content, parent_id, tool_call_id, tool_name, tool_calls, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                message.role.to_string(),
                content_json,
                message.parent_id,
                message.tool_call_id,
                message.tool_name,
                tool_calls_json,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();

        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE session_id = ?2",
            params![now, session_id],
        )?;

        if message.role == MessageRole::User {
            let user_message_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND role = 'user'",
                params![session_id],
                |r| r.get(0),
            )?;

            if user_message_count <= 1 {
                let existing_title: Option<Option<String>> = conn
                    .query_row(
                        "SELECT title FROM conversations WHERE session_id = ?1",
                        params![session_id],
                        |r| r.get(0),
                    )
                    .optional()?;

                if existing_title.flatten().is_none() {
                    let preview = match &message.content {
                        Content::Plain { text } => truncate_title(text),
                        Content::Parts { parts } => parts
                            .iter()
                            .find_map(|p| match p {
                                ContentPart::Text { text } => Some(truncate_title(text)),
                                _ => None,
                            })
                            .unwrap_or_else(|| "New conversation".to_string()),
                    };
                    conn.execute(
                        "UPDATE conversations SET title = ?1, title_source = 'auto' WHERE session_id = ?2",
                        params![preview, session_id],
                    )?;
                }
            }
        }

        Ok(Message {
            id,
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content,
            parent_id: message.parent_id,
            tool_call_id: message.tool_call_id,
            tool_name: message.tool_name,
            tool_calls: message.tool_calls,
            created_at: now,
        })
    }

    /// Returns all messages for the session in `id` order (spec property 1).
    /// Attachment URL freshness is handled by the caller (the `attachments`
    /// crate), since refreshing a signed URL needs an object-store client
    /// this crate doesn't hold.
    #[instrument(skip(self))]
    pub fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, parent_id, tool_call_id, tool_name, tool_calls, created_at
             FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Returns saved sessions matching `search` against title or first user
    /// message, ordered by `COALESCE(updated_at, created_at) DESC` (spec
    /// §4.4 `list_sessions`).
    #[instrument(skip(self))]
    pub fn list_sessions(
        &self,
        limit: i64,
        offset: i64,
        search: Option<&str>,
    ) -> Result<Vec<SessionSummary>> {
        let conn = self.conn.lock().unwrap();
        let like = search.map(|s| format!("%{s}%"));

        let mut stmt = conn.prepare(
            "SELECT c.session_id, c.title, c.title_source, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.session_id = c.session_id) AS message_count,
                    (SELECT content FROM messages m WHERE m.session_id = c.session_id AND m.role = 'user' ORDER BY m.id ASC LIMIT 1) AS first_user_content
             FROM conversations c
             WHERE c.saved = 1
               AND (?1 IS NULL OR c.title LIKE ?1 OR EXISTS (
                     SELECT 1 FROM messages m WHERE m.session_id = c.session_id AND m.role = 'user' AND m.content LIKE ?1))
             ORDER BY COALESCE(c.updated_at, c.created_at) DESC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt
            .query_map(params![like, limit, offset], |row| {
                let title_source: String = row.get(2)?;
                let first_user_content: Option<String> = row.get(6)?;
                let preview = first_user_content
                    .and_then(|raw| serde_json::from_str::<Content>(&raw).ok())
                    .map(|c| match c {
                        Content::Plain { text } => truncate_title(&text),
                        Content::Parts { .. } => String::new(),
                    })
                    .unwrap_or_default();
                Ok(SessionSummary {
                    session_id: row.get(0)?,
                    title: row.get(1)?,
                    title_source: title_source.parse().unwrap_or(TitleSource::Auto),
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                    message_count: row.get(5)?,
                    preview,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub fn set_title(&self, session_id: &str, title: &str, source: TitleSource) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE conversations SET title = ?1, title_source = ?2 WHERE session_id = ?3",
            params![title, source.to_string(), session_id],
        )?;
        if changed == 0 {
            return Err(RepositoryError::SessionNotFound {
                id: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// Marks the session saved — called on first append so it shows up in
    /// `list_sessions` (which filters on `saved = 1`).
    pub fn mark_saved(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE conversations SET saved = 1 WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    /// Removes the session and its messages; attachment rows are detached
    /// (not deleted) so a background reaper can clean up blobs later (spec
    /// §4.4 `delete_session`).
    #[instrument(skip(self))]
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])?;
        tx.execute(
            "UPDATE attachments SET deleted = 1 WHERE session_id = ?1",
            params![session_id],
        )?;
        let changed = tx.execute("DELETE FROM conversations WHERE session_id = ?1", params![session_id])?;
        tx.commit()?;

        if changed == 0 {
            return Err(RepositoryError::SessionNotFound {
                id: session_id.to_string(),
            });
        }
        self.write_locks.remove(session_id);
        Ok(())
    }

    // -- Attachments -----------------------------------------------------

    pub fn insert_attachment(&self, attachment: &Attachment) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO attachments (attachment_id, session_id, blob_key, mime_type, size_bytes, signed_url, signed_url_expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                attachment.attachment_id,
                attachment.session_id,
                attachment.blob_key,
                attachment.mime_type,
                attachment.size_bytes,
                attachment.signed_url,
                attachment.signed_url_expires_at,
                attachment.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_attachment(&self, attachment_id: &str) -> Result<Option<Attachment>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT attachment_id, session_id, blob_key, mime_type, size_bytes, signed_url, signed_url_expires_at, created_at
             FROM attachments WHERE attachment_id = ?1 AND deleted = 0",
            params![attachment_id],
            row_to_attachment,
        )
        .optional()
        .map_err(RepositoryError::from)
    }

    pub fn update_attachment_signed_url(
        &self,
        attachment_id: &str,
        signed_url: &str,
        expires_at: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE attachments SET signed_url = ?1, signed_url_expires_at = ?2 WHERE attachment_id = ?3",
            params![signed_url, expires_at, attachment_id],
        )?;
        Ok(())
    }

    pub fn delete_attachment(&self, attachment_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE attachments SET deleted = 1 WHERE attachment_id = ?1",
            params![attachment_id],
        )?;
        Ok(())
    }
}

fn truncate_title(text: &str) -> String {
    const MAX: usize = 80;
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        let truncated: String = trimmed.chars().take(MAX).collect();
        format!("{truncated}…")
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let title_source: String = row.get(2)?;
    let saved: i64 = row.get(3)?;
    Ok(Session {
        session_id: row.get(0)?,
        title: row.get(1)?,
        title_source: title_source.parse().unwrap_or(TitleSource::Auto),
        saved: saved != 0,
        timezone: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let content_raw: String = row.get(3)?;
    let tool_calls_raw: Option<String> = row.get(7)?;

    let content: Content = serde_json::from_str(&content_raw).unwrap_or(Content::Plain {
        text: content_raw.clone(),
    });
    let tool_calls: Vec<ToolCallRecord> = tool_calls_raw
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: role.parse().unwrap_or(MessageRole::User),
        content,
        parent_id: row.get(4)?,
        tool_call_id: row.get(5)?,
        tool_name: row.get(6)?,
        tool_calls,
        created_at: row.get(8)?,
    })
}

fn row_to_attachment(row: &rusqlite::Row) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        attachment_id: row.get(0)?,
        session_id: row.get(1)?,
        blob_key: row.get(2)?,
        mime_type: row.get(3)?,
        size_bytes: row.get(4)?,
        signed_url: row.get(5)?,
        signed_url_expires_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(role: MessageRole, text: &str) -> NewMessage {
        NewMessage {
            role,
            content: Content::plain(text),
            parent_id: None,
            tool_call_id: None,
            tool_name: None,
            tool_calls: vec![],
        }
    }

    #[tokio::test]
    async fn message_ids_are_strictly_increasing() {
        let repo = Repository::in_memory().unwrap();
        let session = repo.get_or_create_session(None, None).await.unwrap();
        repo.mark_saved(&session.session_id).unwrap();

        repo.append_message(&session.session_id, new_message(MessageRole::User, "hi"))
            .await
            .unwrap();
        repo.append_message(&session.session_id, new_message(MessageRole::Assistant, "hello"))
            .await
            .unwrap();

        let messages = repo.list_messages(&session.session_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].id < messages[1].id);
    }

    #[tokio::test]
    async fn first_user_message_sets_auto_title() {
        let repo = Repository::in_memory().unwrap();
        let session = repo.get_or_create_session(None, None).await.unwrap();
        repo.append_message(&session.session_id, new_message(MessageRole::User, "hello there"))
            .await
            .unwrap();

        let updated = repo.get_session(&session.session_id).unwrap().unwrap();
        assert_eq!(updated.title.as_deref(), Some("hello there"));
        assert_eq!(updated.title_source, TitleSource::Auto);
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_for_client_supplied_id() {
        let repo = Repository::in_memory().unwrap();
        let first = repo.get_or_create_session(Some("client-id-1"), None).await.unwrap();
        let second = repo.get_or_create_session(Some("client-id-1"), None).await.unwrap();
        assert_eq!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn delete_session_removes_messages_and_detaches_attachments() {
        let repo = Repository::in_memory().unwrap();
        let session = repo.get_or_create_session(None, None).await.unwrap();
        repo.append_message(&session.session_id, new_message(MessageRole::User, "hi"))
            .await
            .unwrap();
        repo.insert_attachment(&Attachment {
            attachment_id: "a1".to_string(),
            session_id: session.session_id.clone(),
            blob_key: "k".to_string(),
            mime_type: "image/png".to_string(),
            size_bytes: 10,
            signed_url: "http://example/1".to_string(),
            signed_url_expires_at: Utc::now().to_rfc3339(),
            created_at: Utc::now().to_rfc3339(),
        })
        .unwrap();

        repo.delete_session(&session.session_id).await.unwrap();
        assert!(repo.get_session(&session.session_id).unwrap().is_none());
        assert!(repo.get_attachment("a1").unwrap().is_none());
    }
}
