use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{ChatRequest, ChatResponse, Content, LlmProvider, ProviderError, Role, ToolCall};
use crate::stream::{ChunkAssembler, SseFrameSplitter, StreamEvent, DONE_SENTINEL};

/// Client for the single upstream, OpenAI-compatible chat-completions
/// endpoint the gateway talks to (spec §1 Non-goals: "assumes an upstream
/// provider that accepts an OpenAI-style chat-completion request").
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    provider_name: String,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, api_key: String, base_url: String) -> Self {
        Self {
            client,
            provider_name: "openai-compatible".to_string(),
            api_key,
            base_url,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req, false);

        debug!(model = %req.model, "sending request to provider");

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let resp = check_status(resp).await?;

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);

        debug!(model = %req.model, "sending streaming request to provider");

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let resp = check_status(resp).await?;

        process_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }

    /// Proxies the provider's model-catalog response (spec §6 `/api/models`).
    /// The gateway's HTTP layer computes facets and applies
    /// `search`/`tools_only` filtering on top of this.
    async fn list_models(&self) -> Result<serde_json::Value, ProviderError> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let resp = self.client.get(url).bearer_auth(&self.api_key).send().await?;
        let resp = check_status(resp).await?;
        resp.json().await.map_err(|e| ProviderError::Parse(e.to_string()))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status().as_u16();
    if status == 429 {
        let retry = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|s| s * 1000)
            .unwrap_or(5000);
        return Err(ProviderError::RateLimited {
            retry_after_ms: retry,
        });
    }
    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        warn!(status, body = %text, "provider API error");
        return Err(ProviderError::Api {
            status,
            message: text,
        });
    }
    Ok(resp)
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

pub(crate) fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = vec![serde_json::json!({
        "role": "system",
        "content": req.system,
    })];

    for m in &req.messages {
        let mut entry = serde_json::json!({
            "role": role_str(m.role),
            "content": match &m.content {
                Content::Text(s) => serde_json::json!(s),
                // OpenAI tool-result messages are text-only; flatten parts
                // for any other role rather than leak the richer shape.
                Content::Parts(_) => serde_json::json!(m.content.as_flat_text()),
            },
        });
        if let Some(obj) = entry.as_object_mut() {
            if !m.tool_calls.is_empty() {
                obj.insert(
                    "tool_calls".to_string(),
                    serde_json::json!(m
                        .tool_calls
                        .iter()
                        .map(|tc| serde_json::json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        }))
                        .collect::<Vec<_>>()),
                );
            }
            if let Some(id) = &m.tool_call_id {
                obj.insert("tool_call_id".to_string(), serde_json::json!(id));
            }
        }
        messages.push(entry);
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "stream": stream,
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }

    // Flattened sampling parameters on the outbound request (spec §9 Open
    // Question: nested when persisted, flat on the wire).
    if let Ok(serde_json::Value::Object(params)) = serde_json::to_value(&req.parameters) {
        if let Some(obj) = body.as_object_mut() {
            obj.extend(params);
        }
    }

    let overrides = &req.provider_overrides;
    if overrides.sort.is_some()
        || overrides.data_collection.is_some()
        || overrides.allow_fallbacks.is_some()
        || overrides.require_parameters.is_some()
    {
        body["provider"] = serde_json::json!({
            "sort": overrides.sort,
            "data_collection": overrides.data_collection,
            "allow_fallbacks": overrides.allow_fallbacks,
            "require_parameters": overrides.require_parameters,
        });
    }

    body
}

pub(crate) fn parse_response(resp: ApiResponse) -> ChatResponse {
    let choice = resp.choices.into_iter().next();
    let content = choice
        .as_ref()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();

    let tool_calls: Vec<ToolCall> = choice
        .as_ref()
        .and_then(|c| c.message.tool_calls.as_ref())
        .map(|calls| {
            calls
                .iter()
                .map(|tc| {
                    let arguments: serde_json::Value =
                        serde_json::from_str(&tc.function.arguments).unwrap_or_default();
                    ToolCall {
                        id: tc.id.clone(),
                        name: tc.function.name.clone(),
                        arguments,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let stop_reason = choice.and_then(|c| c.finish_reason).unwrap_or_default();

    ChatResponse {
        content: Content::Text(content),
        model: resp.model,
        tokens_in: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
        tokens_out: resp.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
        stop_reason,
        tool_calls,
    }
}

/// Drives the provider's SSE body to completion via [`SseFrameSplitter`] +
/// [`ChunkAssembler`] (spec §4.2), emitting `TextDelta`s as they arrive and
/// a terminal `Done`/`Error`.
pub(crate) async fn process_stream(resp: reqwest::Response, model: String, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut splitter = SseFrameSplitter::new();
    let mut assembler = ChunkAssembler::new(&model);
    let mut byte_stream = resp.bytes_stream();
    let mut saw_done = false;

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        for frame in splitter.push(text) {
            let Some(data) = frame.data else { continue };
            if data.trim() == DONE_SENTINEL {
                saw_done = true;
                break 'outer;
            }
            if let Some(event) = assembler.feed(&data) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }

    if !saw_done {
        if let Some(frame) = splitter.finish() {
            if let Some(data) = frame.data {
                if data.trim() != DONE_SENTINEL {
                    assembler.feed(&data);
                } else {
                    saw_done = true;
                }
            }
        }
    }

    if !saw_done {
        warn!("provider stream ended without [DONE] sentinel");
    }

    let _ = tx.send(assembler.finish()).await;
}

#[derive(Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) model: String,
    pub(crate) choices: Vec<Choice>,
    pub(crate) usage: Option<Usage>,
}

#[derive(Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: ChatMessage,
    pub(crate) finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ChatMessage {
    pub(crate) content: Option<String>,
    pub(crate) tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
pub(crate) struct ApiToolCall {
    pub(crate) id: String,
    pub(crate) function: ApiFunction,
}

#[derive(Deserialize)]
pub(crate) struct ApiFunction {
    pub(crate) name: String,
    pub(crate) arguments: String,
}

#[derive(Deserialize)]
pub(crate) struct Usage {
    pub(crate) prompt_tokens: u32,
    pub(crate) completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatRequest, ProviderOverrides, SamplingParameters};

    #[test]
    fn request_body_includes_system_and_tools() {
        let req = ChatRequest {
            model: "m".to_string(),
            system: "be nice".to_string(),
            messages: vec![],
            parameters: SamplingParameters::default(),
            provider_overrides: ProviderOverrides::default(),
            stream: false,
            tools: vec![],
        };
        let body = build_request_body(&req, false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be nice");
        assert_eq!(body["stream"], false);
    }
}
