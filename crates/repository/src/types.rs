use serde::{Deserialize, Serialize};

/// A persisted chat session (spec §3 "Session").
///
/// Identity is an opaque `session_id` — client- or server-minted — not the
/// structured `user:agent:name` triple an earlier revision of this gateway
/// used; the spec's client surface has no user/agent hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub title: Option<String>,
    pub title_source: TitleSource,
    pub saved: bool,
    pub timezone: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleSource {
    Auto,
    Ai,
    User,
}

impl std::fmt::Display for TitleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TitleSource::Auto => "auto",
            TitleSource::Ai => "ai",
            TitleSource::User => "user",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TitleSource {
    type Err = crate::error::RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(TitleSource::Auto),
            "ai" => Ok(TitleSource::Ai),
            "user" => Ok(TitleSource::User),
            other => Err(crate::error::RepositoryError::InvalidTitleSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for MessageRole {
    type Err = crate::error::RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool" => Ok(MessageRole::Tool),
            other => Err(crate::error::RepositoryError::InvalidRole(other.to_string())),
        }
    }
}

/// Polymorphic message content (spec §3 "Content Model"). Persisted as
/// JSON; `Plain` round-trips to a bare SQL TEXT column, `Parts` is tagged so
/// readers can tell which shape to expect without sniffing the JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    Plain { text: String },
    Parts { parts: Vec<ContentPart> },
}

impl Content {
    pub fn plain(text: impl Into<String>) -> Self {
        Content::Plain { text: text.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        url: String,
        mime_type: Option<String>,
        attachment_id: Option<String>,
    },
    ToolResultText {
        text: String,
    },
}

/// A tool call recorded on an assistant message (spec §3 "Tool Call").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments_json: serde_json::Value,
}

/// A persisted message (spec §3 "Message").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub role: MessageRole,
    pub content: Content,
    pub parent_id: Option<i64>,
    /// Required iff `role == Tool`.
    pub tool_call_id: Option<String>,
    /// Required iff `role == Tool`.
    pub tool_name: Option<String>,
    /// Populated only on assistant messages that requested tool calls.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    pub created_at: String,
}

/// A new message to append, before an `id` has been assigned.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: Content,
    pub parent_id: Option<i64>,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// A persisted attachment row (spec §3 "Attachment").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub attachment_id: String,
    pub session_id: String,
    pub blob_key: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub signed_url: String,
    pub signed_url_expires_at: String,
    pub created_at: String,
}

/// Summary row returned by `list_sessions` (spec §6 `/api/chat/conversations`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: Option<String>,
    pub title_source: TitleSource,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: u32,
    pub preview: String,
}
