//! Per-turn control flow (spec §4.1): session resolution, history load,
//! system-prompt composition, model snapshot, tool catalog, tool loop,
//! persistence.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use attachments::AttachmentService;
use model_settings::{ModelSettingsService, ProviderOverrideKey, TitleCompletion};
use repository::{
    Content as RepoContent, ContentPart as RepoContentPart, MessageRole, NewMessage, Repository,
    ToolCallRecord,
};
use tool_aggregator::{ToolAggregator, ToolImage};

use crate::planner::{self, ToolDigestEntry};
use crate::provider::{
    ChatRequest, Content, ContentPart, LlmProvider, Message, ProviderError, ProviderOverrides,
    Role, SamplingParameters, ToolCall, ToolDefinition,
};
use crate::stream::{AssembledToolCall, StreamEvent};

/// Wiring shared across every turn. Built once per gateway process and
/// cloned (as an `Arc`) into each spawned turn task.
pub struct TurnContext {
    pub repository: Arc<Repository>,
    pub provider: Arc<dyn LlmProvider>,
    pub aggregator: Arc<ToolAggregator>,
    pub model_settings: Arc<ModelSettingsService>,
    pub attachments: Arc<AttachmentService>,
    pub title_completion: Option<Arc<dyn TitleCompletion>>,
    pub max_tool_iterations: usize,
    pub planner_enabled: bool,
    pub planner_model: String,
}

/// Event emitted to the caller as a turn progresses (the "lazy sequence" of
/// spec §4.1). `gateway` drains these into SSE frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessedTurn {
    Session { session_id: String },
    Delta { text: String },
    ToolStarted { call_id: String, name: String },
    ToolFinished { call_id: String, name: String, result: String },
    ToolError { call_id: String, name: String, reason: String, transient: bool },
    Done,
    Error { code: String, message: String },
}

const CHANNEL_CAPACITY: usize = 128;

/// Entry point: spawns the turn as a background task and returns the
/// receiving half of its event channel immediately.
pub fn process_stream(
    ctx: Arc<TurnContext>,
    session_id: Option<String>,
    incoming_content: RepoContent,
    timezone: Option<String>,
    model_override: Option<String>,
    cancel: CancellationToken,
) -> mpsc::Receiver<ProcessedTurn> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        if let Err(e) = run_turn(&ctx, session_id, incoming_content, timezone, model_override, &cancel, &tx).await {
            warn!(error = %e, "turn ended in error");
            let _ = tx
                .send(ProcessedTurn::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
                .await;
        }
        let _ = tx.send(ProcessedTurn::Done).await;
    });
    rx
}

async fn run_turn(
    ctx: &Arc<TurnContext>,
    session_id: Option<String>,
    incoming_content: RepoContent,
    timezone: Option<String>,
    model_override: Option<String>,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<ProcessedTurn>,
) -> gateway_core::Result<()> {
    let is_new = session_id.is_none()
        || !ctx
            .repository
            .get_session(session_id.as_deref().unwrap_or_default())?
            .is_some();

    let session = ctx
        .repository
        .get_or_create_session(session_id.as_deref(), timezone.as_deref())
        .await?;

    if is_new {
        let _ = tx
            .send(ProcessedTurn::Session {
                session_id: session.session_id.clone(),
            })
            .await;
    }

    ctx.repository.append_message(
        &session.session_id,
        NewMessage {
            role: MessageRole::User,
            content: incoming_content,
            parent_id: None,
            tool_call_id: None,
            tool_name: None,
            tool_calls: Vec::new(),
        },
    )
    .await?;
    ctx.repository.mark_saved(&session.session_id)?;

    let history = ctx.repository.list_messages(&session.session_id)?;
    let mut refreshed_history = Vec::with_capacity(history.len());
    for message in history {
        refreshed_history.push(ctx.attachments.refresh_message_urls(message).await);
    }
    let mut messages: Vec<Message> = refreshed_history.iter().map(to_provider_message).collect();

    let snapshot = ctx.model_settings.get_active().await;
    let model_id = model_override.unwrap_or_else(|| snapshot.model_id.clone());
    let system = gateway_core::time::compose_system_message(
        session.timezone.as_deref(),
        snapshot.system_prompt.as_deref(),
    );
    let parameters = snapshot_to_sampling_parameters(&snapshot.parameters);
    let provider_overrides = snapshot_to_provider_overrides(&snapshot.provider_overrides);

    let openai_tools = ctx.aggregator.openai_tools().await;
    let mut tool_definitions = to_tool_definitions(&openai_tools);

    if ctx.planner_enabled && !tool_definitions.is_empty() {
        let digest: Vec<ToolDigestEntry> = tool_definitions
            .iter()
            .map(|t| ToolDigestEntry {
                qualified_name: t.name.clone(),
                description: t.description.clone(),
            })
            .collect();
        let tail: Vec<Message> = messages.iter().rev().take(6).rev().cloned().collect();
        let plan = planner::plan_tools(&*ctx.provider, &ctx.planner_model, &tail, &digest).await;
        if !plan.broad_search && !plan.candidate_tools.is_empty() {
            let candidates: std::collections::HashSet<&str> =
                plan.candidate_tools.iter().map(String::as_str).collect();
            tool_definitions.retain(|t| candidates.contains(t.name.as_str()));
        }
        info!(intent = %plan.intent, tool_count = tool_definitions.len(), "tool plan applied");
    }

    // Images a tool returned are surfaced on the *next* assistant turn's
    // content parts, never on the tool-result message itself (spec §4.3,
    // final paragraph). Drained and attached at the top of whichever
    // branch below persists the next assistant message.
    let mut pending_images: Vec<PendingImage> = Vec::new();

    for iteration in 0..ctx.max_tool_iterations {
        if cancel.is_cancelled() {
            info!(session_id = %session.session_id, "turn cancelled before next provider call");
            return Err(gateway_core::GatewayError::Cancelled);
        }

        let request = ChatRequest {
            model: model_id.clone(),
            system: system.clone(),
            messages: messages.clone(),
            parameters: parameters.clone(),
            provider_overrides: provider_overrides.clone(),
            stream: true,
            tools: tool_definitions.clone(),
        };

        let turn_result = stream_one_provider_turn(ctx, &request, cancel, tx).await?;

        if turn_result.tool_calls.is_empty() {
            let content = content_with_pending_images(turn_result.text, std::mem::take(&mut pending_images));
            ctx.repository.append_message(
                &session.session_id,
                NewMessage {
                    role: MessageRole::Assistant,
                    content,
                    parent_id: None,
                    tool_call_id: None,
                    tool_name: None,
                    tool_calls: Vec::new(),
                },
            )
            .await?;

            maybe_generate_title(ctx, &session.session_id).await;
            return Ok(());
        }

        let tool_call_records: Vec<ToolCallRecord> = turn_result
            .tool_calls
            .iter()
            .filter_map(|c| match c {
                AssembledToolCall::Valid(call) => Some(ToolCallRecord {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments_json: call.arguments.clone(),
                }),
                AssembledToolCall::Malformed { id, name } => Some(ToolCallRecord {
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                    arguments_json: json!({}),
                }),
            })
            .collect();

        let pending = std::mem::take(&mut pending_images);
        let repo_content = content_with_pending_images(turn_result.text.clone(), pending.clone());

        ctx.repository.append_message(
            &session.session_id,
            NewMessage {
                role: MessageRole::Assistant,
                content: repo_content,
                parent_id: None,
                tool_call_id: None,
                tool_name: None,
                tool_calls: tool_call_records.clone(),
            },
        )
        .await?;

        messages.push(Message {
            role: Role::Assistant,
            content: provider_content_with_pending_images(turn_result.text, pending),
            tool_calls: tool_call_records
                .iter()
                .map(|r| ToolCall {
                    id: r.tool_call_id.clone(),
                    name: r.tool_name.clone(),
                    arguments: r.arguments_json.clone(),
                })
                .collect(),
            tool_call_id: None,
        });

        for assembled in &turn_result.tool_calls {
            if cancel.is_cancelled() {
                // A call already in flight is allowed to finish, but no further
                // tool call in this batch is started (spec §5 "Cancellation").
                break;
            }

            let (call_id, name) = match assembled {
                AssembledToolCall::Valid(c) => (c.id.clone(), c.name.clone()),
                AssembledToolCall::Malformed { id, name } => (id.clone(), name.clone()),
            };

            let _ = tx
                .send(ProcessedTurn::ToolStarted {
                    call_id: call_id.clone(),
                    name: name.clone(),
                })
                .await;

            let tool_text = match assembled {
                AssembledToolCall::Malformed { .. } => {
                    let reason = "tool call arguments were not valid JSON".to_string();
                    let _ = tx
                        .send(ProcessedTurn::ToolError {
                            call_id: call_id.clone(),
                            name: name.clone(),
                            reason: reason.clone(),
                            transient: false,
                        })
                        .await;
                    format!("error: {reason}")
                }
                AssembledToolCall::Valid(call) => {
                    match ctx
                        .aggregator
                        .invoke(&call.name, call.arguments.clone(), &session.session_id)
                        .await
                    {
                        Ok(outcome) => {
                            let summary = summarize(&outcome.text);
                            let _ = tx
                                .send(ProcessedTurn::ToolFinished {
                                    call_id: call_id.clone(),
                                    name: name.clone(),
                                    result: summary,
                                })
                                .await;
                            for image in outcome.images {
                                if let Some(saved) =
                                    persist_tool_image(ctx, &session.session_id, image).await
                                {
                                    pending_images.push(saved);
                                }
                            }
                            outcome.text
                        }
                        Err(e) => {
                            let (reason, transient) = match &e {
                                gateway_core::GatewayError::ToolFailure { reason, transient, .. } => {
                                    (reason.clone(), *transient)
                                }
                                other => (other.to_string(), false),
                            };
                            error!(tool = %name, error = %reason, "tool invocation failed");
                            let _ = tx
                                .send(ProcessedTurn::ToolError {
                                    call_id: call_id.clone(),
                                    name: name.clone(),
                                    reason: reason.clone(),
                                    transient,
                                })
                                .await;
                            format!("error: {reason}")
                        }
                    }
                }
            };

            ctx.repository.append_message(
                &session.session_id,
                NewMessage {
                    role: MessageRole::Tool,
                    content: RepoContent::plain(tool_text.clone()),
                    parent_id: None,
                    tool_call_id: Some(call_id.clone()),
                    tool_name: Some(name.clone()),
                    tool_calls: Vec::new(),
                },
            )
            .await?;

            messages.push(Message {
                role: Role::Tool,
                content: Content::text(tool_text),
                tool_calls: Vec::new(),
                tool_call_id: Some(call_id),
            });
        }

        info!(iteration, "tool loop re-entering with updated messages");
    }

    Err(gateway_core::GatewayError::ToolLoopExhausted {
        iterations: ctx.max_tool_iterations,
    })
}

/// A tool-returned image already persisted as an attachment, waiting to be
/// attached to the next assistant message (spec §4.3, final paragraph).
#[derive(Debug, Clone)]
struct PendingImage {
    url: String,
    mime_type: Option<String>,
    attachment_id: String,
}

/// Fetches a tool-returned image's bytes, decoding inline `data:` URIs
/// without a network round trip and falling back to an HTTP `GET` for
/// external links. Returns `None` on any parse/transport failure; the
/// caller logs and drops the image rather than failing the turn.
async fn fetch_tool_image(url: &str, declared_mime: Option<&str>) -> Option<(Bytes, String)> {
    if let Some(data) = url.strip_prefix("data:") {
        let (meta, payload) = data.split_once(',')?;
        let sniffed_mime = meta.split(';').next().filter(|m| !m.is_empty());
        let mime = declared_mime
            .or(sniffed_mime)
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = STANDARD.decode(payload).ok()?;
        return Some((Bytes::from(bytes), mime));
    }

    let response = reqwest::get(url).await.ok()?;
    let sniffed_mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mime = declared_mime
        .map(str::to_string)
        .or(sniffed_mime)
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let bytes = response.bytes().await.ok()?;
    Some((bytes, mime))
}

/// Fetches and persists one tool-returned image as an attachment. Failures
/// are logged and swallowed: a tool call that produced text plus an
/// unreachable image link should not fail the whole turn.
async fn persist_tool_image(
    ctx: &Arc<TurnContext>,
    session_id: &str,
    image: ToolImage,
) -> Option<PendingImage> {
    let Some((bytes, mime)) = fetch_tool_image(&image.url, image.mime_type.as_deref()).await
    else {
        warn!(url = %image.url, "failed to fetch tool-returned image, dropping it");
        return None;
    };

    match ctx.attachments.save_tool_image(session_id, bytes, &mime).await {
        Ok(saved) => Some(PendingImage {
            url: saved.signed_url,
            mime_type: Some(saved.mime),
            attachment_id: saved.attachment_id,
        }),
        Err(e) => {
            warn!(error = %e, "failed to persist tool-returned image as an attachment");
            None
        }
    }
}

/// Builds the repository content for an assistant message, appending any
/// pending tool images as trailing `ImageUrl` parts (spec §4.3, final
/// paragraph). Falls back to plain text when there are none, matching the
/// un-augmented shape most assistant turns have.
fn content_with_pending_images(text: String, pending: Vec<PendingImage>) -> RepoContent {
    if pending.is_empty() {
        return RepoContent::plain(text);
    }
    let mut parts = vec![RepoContentPart::Text { text }];
    parts.extend(pending.into_iter().map(|p| RepoContentPart::ImageUrl {
        url: p.url,
        mime_type: p.mime_type,
        attachment_id: Some(p.attachment_id),
    }));
    RepoContent::Parts { parts }
}

/// Provider-wire-format counterpart of [`content_with_pending_images`], kept
/// in sync so the in-memory `messages` fed back to the provider reflect the
/// same images as what was just persisted.
fn provider_content_with_pending_images(text: String, pending: Vec<PendingImage>) -> Content {
    if pending.is_empty() {
        return Content::text(text);
    }
    let mut parts = vec![ContentPart::Text { text }];
    parts.extend(pending.into_iter().map(|p| ContentPart::ImageUrl {
        url: p.url,
        mime_type: p.mime_type,
        attachment_id: Some(p.attachment_id),
    }));
    Content::Parts(parts)
}

struct OneTurnResult {
    text: String,
    tool_calls: Vec<AssembledToolCall>,
}

/// An attempt at streaming one provider turn, classified so
/// [`gateway_core::retry::with_backoff`] knows whether it's worth retrying:
/// only a transient provider error that occurred before any text reached
/// the client is — once a delta has been forwarded the turn cannot be
/// silently replayed.
enum TurnAttemptError {
    Retryable(gateway_core::GatewayError),
    Fatal(gateway_core::GatewayError),
}

/// Streams a single provider turn, forwarding text deltas to `tx` as they
/// arrive. Retries with exponential backoff on a transient provider error
/// that occurred before any text was forwarded (spec §9 Open Question,
/// resolved in SPEC_FULL.md §9).
async fn stream_one_provider_turn(
    ctx: &Arc<TurnContext>,
    request: &ChatRequest,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<ProcessedTurn>,
) -> gateway_core::Result<OneTurnResult> {
    let result = gateway_core::retry::with_backoff(
        |e: &TurnAttemptError| matches!(e, TurnAttemptError::Retryable(_)),
        || run_one_provider_attempt(ctx, request, cancel, tx),
    )
    .await;

    match result {
        Ok(turn) => Ok(turn),
        Err(TurnAttemptError::Retryable(e)) | Err(TurnAttemptError::Fatal(e)) => Err(e),
    }
}

async fn run_one_provider_attempt(
    ctx: &Arc<TurnContext>,
    request: &ChatRequest,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<ProcessedTurn>,
) -> Result<OneTurnResult, TurnAttemptError> {
    let mut forwarded_any = false;
    let (provider_tx, mut provider_rx) = mpsc::channel::<StreamEvent>(CHANNEL_CAPACITY);

    // Run the provider call as its own task so the channel closes (and
    // `recv()` drains to `None`) only once every event has been sent,
    // regardless of how the two futures happen to get polled.
    let send_handle = tokio::spawn({
        let provider = ctx.provider.clone();
        let request = request.clone();
        async move { provider.send_stream(&request, provider_tx).await }
    });

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut stream_error: Option<String> = None;
    let mut cancelled = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                None
            }
            event = provider_rx.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            StreamEvent::TextDelta { text: delta } => {
                forwarded_any = true;
                text.push_str(&delta);
                let _ = tx.send(ProcessedTurn::Delta { text: delta }).await;
            }
            StreamEvent::Done { tool_calls: calls, .. } => {
                tool_calls = calls;
            }
            StreamEvent::Error { message } => {
                stream_error = Some(message);
            }
        }
    }

    if cancelled {
        send_handle.abort();
        return Err(TurnAttemptError::Fatal(gateway_core::GatewayError::Cancelled));
    }

    let send_result = send_handle
        .await
        .unwrap_or_else(|e| Err(ProviderError::Unavailable(format!("provider task panicked: {e}"))));

    if let Err(e) = send_result {
        if !forwarded_any && e.is_transient() {
            return Err(TurnAttemptError::Retryable(classify_provider_error(&e.to_string())));
        }
        stream_error = Some(e.to_string());
    }

    match stream_error {
        Some(message) => Err(TurnAttemptError::Fatal(classify_provider_error(&message))),
        None => Ok(OneTurnResult { text, tool_calls }),
    }
}

fn classify_provider_error(message: &str) -> gateway_core::GatewayError {
    if message.contains("401") || message.contains("auth") {
        gateway_core::GatewayError::ProviderFatal(message.to_string())
    } else {
        gateway_core::GatewayError::ProviderTransient(message.to_string())
    }
}

async fn maybe_generate_title(ctx: &Arc<TurnContext>, session_id: &str) {
    let Some(completion) = ctx.title_completion.clone() else {
        return;
    };
    let Ok(Some(session)) = ctx.repository.get_session(session_id) else {
        return;
    };
    if session.title_source != repository::TitleSource::Auto {
        return;
    }
    let Ok(history) = ctx.repository.list_messages(session_id) else {
        return;
    };

    let ctx = ctx.clone();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let conversation_text: String = history
            .iter()
            .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
            .map(|m| format!("{}: {}", m.role, flat_repo_content(&m.content)))
            .collect::<Vec<_>>()
            .join("\n");

        match model_settings::generate_title(&*completion, &conversation_text).await {
            Ok(title) => {
                if let Err(e) = ctx
                    .repository
                    .set_title(&session_id, &title, repository::TitleSource::Ai)
                {
                    warn!(error = %e, "failed to persist generated title");
                }
            }
            Err(e) => {
                warn!(error = %e, "title generation skipped, leaving existing title");
            }
        }
    });
}

fn flat_repo_content(content: &RepoContent) -> String {
    match content {
        RepoContent::Plain { text } => text.clone(),
        RepoContent::Parts { parts } => parts
            .iter()
            .filter_map(|p| match p {
                RepoContentPart::Text { text } => Some(text.clone()),
                RepoContentPart::ToolResultText { text } => Some(text.clone()),
                RepoContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn summarize(text: &str) -> String {
    const MAX: usize = 200;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(MAX).collect();
        format!("{truncated}…")
    }
}

fn to_provider_message(message: &repository::Message) -> Message {
    let role = match message.role {
        MessageRole::System => Role::System,
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
        MessageRole::Tool => Role::Tool,
    };

    let content = match &message.content {
        RepoContent::Plain { text } => Content::Text(text.clone()),
        RepoContent::Parts { parts } => Content::Parts(
            parts
                .iter()
                .map(|p| match p {
                    RepoContentPart::Text { text } => ContentPart::Text { text: text.clone() },
                    RepoContentPart::ImageUrl { url, mime_type, attachment_id } => ContentPart::ImageUrl {
                        url: url.clone(),
                        mime_type: mime_type.clone(),
                        attachment_id: attachment_id.clone(),
                    },
                    RepoContentPart::ToolResultText { text } => ContentPart::ToolResultText { text: text.clone() },
                })
                .collect(),
        ),
    };

    Message {
        role,
        content,
        tool_calls: message
            .tool_calls
            .iter()
            .map(|r| ToolCall {
                id: r.tool_call_id.clone(),
                name: r.tool_name.clone(),
                arguments: r.arguments_json.clone(),
            })
            .collect(),
        tool_call_id: message.tool_call_id.clone(),
    }
}

/// `ModelConfigSnapshot::parameters` is a bare `{name: value}` map so
/// `model-settings` never needs to know `orchestrator`'s sampling-parameter
/// shape; field names are expected to line up with [`SamplingParameters`],
/// and anything that doesn't is ignored rather than rejected.
fn snapshot_to_sampling_parameters(
    params: &std::collections::HashMap<String, serde_json::Value>,
) -> SamplingParameters {
    let value = serde_json::Value::Object(params.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    serde_json::from_value(value).unwrap_or_default()
}

fn snapshot_to_provider_overrides(
    overrides: &std::collections::HashMap<ProviderOverrideKey, serde_json::Value>,
) -> ProviderOverrides {
    let mut out = ProviderOverrides::default();
    for (key, value) in overrides {
        match key {
            ProviderOverrideKey::RoutingSort => out.sort = value.as_str().map(str::to_string),
            ProviderOverrideKey::DataCollectionPolicy => {
                out.data_collection = value.as_str().map(str::to_string)
            }
            ProviderOverrideKey::AllowFallbacks => out.allow_fallbacks = value.as_bool(),
            ProviderOverrideKey::RequireParameters => out.require_parameters = value.as_bool(),
        }
    }
    out
}

fn to_tool_definitions(openai_tools: &[serde_json::Value]) -> Vec<ToolDefinition> {
    openai_tools
        .iter()
        .filter_map(|t| {
            let function = t.get("function")?;
            Some(ToolDefinition {
                name: function.get("name")?.as_str()?.to_string(),
                description: function
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string(),
                input_schema: function.get("parameters").cloned().unwrap_or_else(|| json!({})),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatResponse;

    /// Never actually invoked in the cancellation test below — a cancelled
    /// token is observed before the first provider call — but `TurnContext`
    /// needs a concrete `LlmProvider` to construct.
    struct UnreachableProvider;

    #[async_trait::async_trait]
    impl LlmProvider for UnreachableProvider {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            panic!("provider should not be called once the turn's token is already cancelled");
        }
    }

    async fn test_context() -> (Arc<TurnContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(Repository::in_memory().unwrap());
        let model_settings = Arc::new(
            ModelSettingsService::load_or_init(
                dir.path().join("active.json"),
                model_settings::ModelConfigSnapshot::new("test/model"),
            )
            .unwrap(),
        );
        let blob_store = attachments::BlobStore::local(&dir.path().join("blobs")).unwrap();
        let signer = attachments::UrlSigner::new("https://gw.example/api/attachments", "s3cr3t");
        let attachment_service = Arc::new(attachments::AttachmentService::new(
            repository.clone(),
            blob_store,
            signer,
            vec!["image/png".to_string(), "image/jpeg".to_string()],
            10 * 1024 * 1024,
            7,
        ));
        let ctx = Arc::new(TurnContext {
            repository,
            provider: Arc::new(UnreachableProvider),
            aggregator: Arc::new(ToolAggregator::new()),
            model_settings,
            attachments: attachment_service,
            title_completion: None,
            max_tool_iterations: 4,
            planner_enabled: true,
            planner_model: "test/model".to_string(),
        });
        (ctx, dir)
    }

    #[tokio::test]
    async fn a_precancelled_token_short_circuits_before_any_provider_call() {
        let (ctx, _dir) = test_context().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut rx = process_stream(ctx, None, RepoContent::plain("hello"), None, None, cancel);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert!(matches!(
            events.first(),
            Some(ProcessedTurn::Session { .. })
        ));
        assert!(matches!(
            events.get(1),
            Some(ProcessedTurn::Error { code, .. }) if code == "cancelled"
        ));
        assert!(matches!(events.last(), Some(ProcessedTurn::Done)));
    }

    /// Fails transiently twice before succeeding, so `stream_one_provider_turn`
    /// must retry via `gateway_core::retry::with_backoff` to ever complete.
    struct FlakyProvider {
        failures_remaining: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            if self
                .failures_remaining
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst)
                > 0
            {
                return Err(ProviderError::Unavailable("temporarily down".to_string()));
            }
            Ok(ChatResponse {
                content: Content::text("ok"),
                model: "test/model".to_string(),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: "stop".to_string(),
                tool_calls: Vec::new(),
            })
        }
    }

    fn test_request() -> ChatRequest {
        ChatRequest {
            model: "test/model".to_string(),
            system: String::new(),
            messages: Vec::new(),
            parameters: SamplingParameters::default(),
            provider_overrides: ProviderOverrides::default(),
            stream: true,
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn stream_one_provider_turn_retries_a_transient_failure_before_any_delta() {
        let (ctx, _dir) = test_context().await;
        let ctx = Arc::new(TurnContext {
            provider: Arc::new(FlakyProvider {
                failures_remaining: std::sync::atomic::AtomicUsize::new(2),
            }),
            ..Arc::try_unwrap(ctx).ok().unwrap()
        });
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);

        let result = stream_one_provider_turn(&ctx, &test_request(), &cancel, &tx)
            .await
            .expect("should succeed once the flaky provider stops failing");

        assert_eq!(result.text, "ok");
        drop(tx);
        let mut deltas = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ProcessedTurn::Delta { text } = event {
                deltas.push(text);
            }
        }
        assert_eq!(deltas, vec!["ok".to_string()]);
    }

    #[test]
    fn content_with_pending_images_stays_plain_text_when_there_are_no_images() {
        let content = content_with_pending_images("hello".to_string(), Vec::new());
        assert!(matches!(content, RepoContent::Plain { text } if text == "hello"));
    }

    #[test]
    fn content_with_pending_images_appends_image_parts_after_the_text() {
        let pending = vec![PendingImage {
            url: "https://gw.example/a1".to_string(),
            mime_type: Some("image/png".to_string()),
            attachment_id: "a1".to_string(),
        }];
        let content = content_with_pending_images("here's the chart".to_string(), pending);
        match content {
            RepoContent::Parts { parts } => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(&parts[0], RepoContentPart::Text { text } if text == "here's the chart"));
                assert!(matches!(
                    &parts[1],
                    RepoContentPart::ImageUrl { attachment_id: Some(id), .. } if id == "a1"
                ));
            }
            other => panic!("expected Parts, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_tool_image_decodes_a_data_uri_without_network_access() {
        let uri = format!("data:image/png;base64,{}", STANDARD.encode(b"fake-png-bytes"));
        let (bytes, mime) = fetch_tool_image(&uri, None).await.expect("data URI should decode");
        assert_eq!(bytes.as_ref(), b"fake-png-bytes");
        assert_eq!(mime, "image/png");
    }
}
