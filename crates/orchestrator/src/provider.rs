use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::stream::{AssembledToolCall, StreamEvent};

/// A single message in the conversation sent to the provider.
///
/// Mirrors the polymorphic content model (spec §3): `content` is either a
/// plain string or an ordered list of parts. Assistant messages carry
/// `tool_calls` when the provider requested tool invocations; `tool`-role
/// messages carry `tool_call_id` identifying which call they answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text(s.into())
    }

    /// Flattens to a single string for providers/tool messages that only
    /// accept plain text (§4.3 invocation: "the tool message ... remains
    /// text-only").
    pub fn as_flat_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::ImageUrl { .. } => None,
                    ContentPart::ToolResultText { text } => Some(text.clone()),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
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

/// Tool definition sent to the LLM API in OpenAI function-calling shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call, either fully assembled (non-streaming / end-of-turn) or as
/// requested by an assistant message being replayed back to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Sampling and routing options recognized and forwarded when set (spec §6
/// "Provider-bound request shape").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_a: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_prompt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_outputs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<serde_json::Value>,
}

/// Provider routing overrides (spec §3 Model Configuration Snapshot).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_fallbacks: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_parameters: Option<bool>,
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Transient system message: time preamble + configured persistent
    /// prompt (gateway_core::time::compose_system_message). Never persisted.
    pub system: String,
    pub messages: Vec<Message>,
    pub parameters: SamplingParameters,
    pub provider_overrides: ProviderOverrides,
    pub stream: bool,
    /// Tools to expose to the LLM, already in OpenAI function shape.
    pub tools: Vec<ToolDefinition>,
}

/// Response from an LLM provider (non-streaming).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Content,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
    /// Tool calls requested by the LLM. Empty when no tools are called.
    pub tool_calls: Vec<ToolCall>,
}

/// Common interface for the upstream LLM provider.
///
/// The spec assumes a single OpenAI-compatible upstream (§1 Non-goals), but
/// the trait boundary is kept so the orchestrator and its tests never touch
/// `reqwest` directly.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming chat request, wait for full response. Used by
    /// the Tool Planner and title generator, both of which want a single
    /// complete response rather than a stream.
    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response events through a channel.
    /// Default: falls back to non-streaming send, emits TextDelta + Done.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.send(req).await?;
        let _ = tx
            .send(StreamEvent::TextDelta {
                text: resp.content.as_flat_text(),
            })
            .await;
        let _ = tx
            .send(StreamEvent::Done {
                model: resp.model,
                tokens_in: resp.tokens_in,
                tokens_out: resp.tokens_out,
                stop_reason: resp.stop_reason,
                tool_calls: resp
                    .tool_calls
                    .into_iter()
                    .map(AssembledToolCall::Valid)
                    .collect(),
            })
            .await;
        Ok(())
    }

    /// Raw provider model-catalog response (spec §6 `/api/models`: "Proxies
    /// provider model catalog"). Default errors out; only providers that
    /// expose a catalog endpoint override this.
    async fn list_models(&self) -> Result<serde_json::Value, ProviderError> {
        Err(ProviderError::Unavailable(format!(
            "{} does not expose a model catalog",
            self.name()
        )))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether this error fits `provider_transient` (spec §7) — a bounded
    /// retry may succeed — as opposed to `provider_fatal` (auth/model/
    /// permission, no retry).
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_) => true,
            ProviderError::RateLimited { .. } => true,
            ProviderError::Unavailable(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Parse(_) => false,
            ProviderError::Cancelled => false,
        }
    }
}
