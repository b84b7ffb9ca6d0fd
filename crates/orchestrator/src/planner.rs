//! Tool Planner (spec §4.1.1): a cheap, non-streaming LLM call that narrows
//! the tool catalog passed to the main turn. A behavioral optimization, not
//! a correctness primitive — any failure falls back to "broad search = all
//! tools".

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::provider::{ChatRequest, Content, LlmProvider, Message, Role, SamplingParameters};

const PLANNER_SYSTEM_PROMPT: &str = "You select which tools, if any, are relevant to the \
    user's most recent request. Respond with JSON only: \
    {\"candidate_tools\": [\"<qualified_tool_name>\"], \"broad_search\": <bool>, \"intent\": \"<one line>\"}. \
    Set broad_search=true if you are unsure which tools apply.";

#[derive(Debug, Clone)]
pub struct ToolDigestEntry {
    pub qualified_name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ToolPlan {
    pub candidate_tools: Vec<String>,
    pub broad_search: bool,
    pub intent: String,
}

impl ToolPlan {
    fn broad(reason: &str) -> Self {
        ToolPlan {
            candidate_tools: Vec::new(),
            broad_search: true,
            intent: reason.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    candidate_tools: Vec<String>,
    #[serde(default)]
    broad_search: bool,
    #[serde(default)]
    intent: String,
}

/// Consults `provider` with the conversation tail and a compacted tool
/// digest (name + one-line description per tool). On any provider or parse
/// error, falls back to a broad-search plan rather than propagating the
/// error — per spec, the planner must never block or fail a turn.
pub async fn plan_tools(
    provider: &dyn LlmProvider,
    planner_model: &str,
    conversation_tail: &[Message],
    digest: &[ToolDigestEntry],
) -> ToolPlan {
    if digest.is_empty() {
        return ToolPlan::broad("no tools registered");
    }

    let digest_text = digest
        .iter()
        .map(|d| format!("- {}: {}", d.qualified_name, d.description))
        .collect::<Vec<_>>()
        .join("\n");

    let mut messages: Vec<Message> = conversation_tail.to_vec();
    messages.push(Message {
        role: Role::User,
        content: Content::text(format!("Available tools:\n{digest_text}")),
        tool_calls: Vec::new(),
        tool_call_id: None,
    });

    let request = ChatRequest {
        model: planner_model.to_string(),
        system: PLANNER_SYSTEM_PROMPT.to_string(),
        messages,
        parameters: SamplingParameters {
            max_tokens: Some(200),
            response_format: Some(json!({ "type": "json_object" })),
            ..Default::default()
        },
        provider_overrides: Default::default(),
        stream: false,
        tools: Vec::new(),
    };

    let timeout = std::time::Duration::from_secs(gateway_core::config::DEFAULT_PLANNER_TIMEOUT_SECS);
    let response = match tokio::time::timeout(timeout, provider.send(&request)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(error = %e, "tool planner call failed, falling back to broad search");
            return ToolPlan::broad("planner call failed");
        }
        Err(_) => {
            warn!("tool planner timed out, falling back to broad search");
            return ToolPlan::broad("planner timed out");
        }
    };

    match serde_json::from_str::<RawPlan>(&response.content.as_flat_text()) {
        Ok(plan) => ToolPlan {
            candidate_tools: plan.candidate_tools,
            broad_search: plan.broad_search,
            intent: plan.intent,
        },
        Err(e) => {
            warn!(error = %e, "tool planner returned unparseable plan, falling back to broad search");
            ToolPlan::broad("planner output unparseable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatResponse, ProviderError};
    use async_trait::async_trait;

    struct StubProvider {
        response: String,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: Content::text(self.response.clone()),
                model: "stub-model".to_string(),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: "stop".to_string(),
                tool_calls: Vec::new(),
            })
        }
    }

    fn digest() -> Vec<ToolDigestEntry> {
        vec![ToolDigestEntry {
            qualified_name: "calendar__list_events".to_string(),
            description: "lists events".to_string(),
        }]
    }

    #[tokio::test]
    async fn parses_well_formed_plan() {
        let provider = StubProvider {
            response: r#"{"candidate_tools": ["calendar__list_events"], "broad_search": false, "intent": "check schedule"}"#.to_string(),
        };
        let plan = plan_tools(&provider, "cheap-model", &[], &digest()).await;
        assert_eq!(plan.candidate_tools, vec!["calendar__list_events".to_string()]);
        assert!(!plan.broad_search);
    }

    #[tokio::test]
    async fn falls_back_to_broad_search_on_malformed_json() {
        let provider = StubProvider {
            response: "not json".to_string(),
        };
        let plan = plan_tools(&provider, "cheap-model", &[], &digest()).await;
        assert!(plan.broad_search);
    }

    #[tokio::test]
    async fn empty_digest_is_broad_search_without_calling_provider() {
        let provider = StubProvider {
            response: String::new(),
        };
        let plan = plan_tools(&provider, "cheap-model", &[], &[]).await;
        assert!(plan.broad_search);
    }
}
