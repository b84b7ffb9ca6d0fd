//! Fire-and-forget session title generation (spec §4.6 "Title generator").
//!
//! Decoupled from `orchestrator::LlmProvider` via a small local trait —
//! `model-settings` has no dependency on `orchestrator` (the dependency
//! runs the other way), so the caller wiring up the gateway binary adapts
//! its `LlmProvider` into [`TitleCompletion`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{ModelSettingsError, Result};

#[async_trait]
pub trait TitleCompletion: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> std::result::Result<String, String>;
}

const TITLE_PROMPT_PREFIX: &str =
    "Summarize this conversation in a short title of 8 words or fewer. \
     Respond with the title only, no quotes or punctuation at the end.\n\n";

/// Generates a title from `conversation_text` (already role-prefixed
/// user+assistant text). Bounds the input to
/// [`gateway_core::config::DEFAULT_TITLE_GEN_MAX_CONTEXT_CHARS`] characters
/// and the whole call to
/// [`gateway_core::config::DEFAULT_TITLE_GEN_TIMEOUT_SECS`] seconds. Callers
/// should treat any `Err` as "leave the existing title untouched" — this
/// function does not retry.
pub async fn generate_title(
    completion: &dyn TitleCompletion,
    conversation_text: &str,
) -> Result<String> {
    let truncated = truncate_chars(
        conversation_text,
        gateway_core::config::DEFAULT_TITLE_GEN_MAX_CONTEXT_CHARS,
    );
    let prompt = format!("{TITLE_PROMPT_PREFIX}{truncated}");
    let timeout = Duration::from_secs(gateway_core::config::DEFAULT_TITLE_GEN_TIMEOUT_SECS);

    let result = tokio::time::timeout(
        timeout,
        completion.complete(&prompt, gateway_core::config::DEFAULT_TITLE_GEN_MAX_TOKENS),
    )
    .await;

    match result {
        Ok(Ok(title)) => Ok(clean_title(&title)),
        Ok(Err(reason)) => {
            warn!(reason, "title generation call failed");
            Err(ModelSettingsError::TitleGeneration(reason))
        }
        Err(_) => {
            warn!("title generation timed out");
            Err(ModelSettingsError::TitleGeneration("timed out".to_string()))
        }
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

fn clean_title(raw: &str) -> String {
    raw.trim().trim_matches('"').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubCompletion {
        response: std::result::Result<String, String>,
    }

    #[async_trait]
    impl TitleCompletion for StubCompletion {
        async fn complete(&self, _prompt: &str, _max_tokens: u32) -> std::result::Result<String, String> {
            self.response.clone()
        }
    }

    #[tokio::test]
    async fn strips_surrounding_quotes_and_whitespace() {
        let stub = StubCompletion {
            response: Ok("  \"Planning a trip\"  ".to_string()),
        };
        let title = generate_title(&stub, "user: where should I go").await.unwrap();
        assert_eq!(title, "Planning a trip");
    }

    #[tokio::test]
    async fn propagates_failure_as_error_not_panic() {
        let stub = StubCompletion {
            response: Err("rate limited".to_string()),
        };
        let err = generate_title(&stub, "user: hi").await.unwrap_err();
        assert!(matches!(err, ModelSettingsError::TitleGeneration(_)));
    }

    #[test]
    fn truncates_to_char_budget() {
        let long = "x".repeat(5000);
        let truncated = truncate_chars(&long, 4000);
        assert_eq!(truncated.chars().count(), 4000);
    }
}
