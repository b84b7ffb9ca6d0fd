//! `ToolAggregator`: warm pool of tool servers, atomic catalog, and
//! invocation routing (spec §4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::catalog::{build_catalog, Catalog};
use crate::config::{ToolServerConfig, TransportConfig};
use crate::error::{AggregatorError, Result};
use crate::protocol::RawContentPart;
use crate::transport::http::HttpToolServer;
use crate::transport::stdio::StdioToolServer;
use crate::transport::ToolServer;

const DEFAULT_TOOL_CALL_TIMEOUT_SECS: u64 = 60;

/// Result of invoking a tool, already split into the text the model sees
/// and any images to surface on the *next* assistant turn (spec §4.3
/// "Invocation", final paragraph).
#[derive(Debug, Clone)]
pub struct ToolInvocationOutcome {
    pub text: String,
    pub images: Vec<ToolImage>,
    pub is_error: bool,
}

#[derive(Debug, Clone)]
pub struct ToolImage {
    pub url: String,
    pub mime_type: Option<String>,
}

pub struct ToolAggregator {
    servers: DashMap<String, Arc<dyn ToolServer>>,
    configs: DashMap<String, ToolServerConfig>,
    catalog: RwLock<Arc<Catalog>>,
    tool_call_timeout: Duration,
}

impl ToolAggregator {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            configs: DashMap::new(),
            catalog: RwLock::new(Arc::new(Catalog::default())),
            tool_call_timeout: Duration::from_secs(DEFAULT_TOOL_CALL_TIMEOUT_SECS),
        }
    }

    pub fn with_tool_call_timeout(mut self, timeout: Duration) -> Self {
        self.tool_call_timeout = timeout;
        self
    }

    pub async fn catalog(&self) -> Arc<Catalog> {
        self.catalog.read().await.clone()
    }

    /// OpenAI-format `tools` array for the current catalog snapshot.
    pub async fn openai_tools(&self) -> Vec<Value> {
        self.catalog.read().await.to_openai_tools()
    }

    /// Diffs `new_configs` against the currently-connected servers, shuts
    /// down removed/disabled ones, connects newly-enabled ones, and swaps
    /// in a freshly built catalog atomically (spec §4.3 "Lifecycle").
    pub async fn refresh(&self, new_configs: Vec<ToolServerConfig>) {
        let new_by_id: HashMap<String, ToolServerConfig> =
            new_configs.into_iter().map(|c| (c.id.clone(), c)).collect();

        let stale_ids: Vec<String> = self
            .configs
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| {
                new_by_id
                    .get(id)
                    .map(|c| !c.enabled)
                    .unwrap_or(true)
            })
            .collect();

        for id in &stale_ids {
            if let Some((_, server)) = self.servers.remove(id) {
                server.shutdown().await;
            }
            self.configs.remove(id);
        }

        // Connect newly-enabled servers in parallel — each `connect` is
        // already bounded by its own timeout, so one hanging server no
        // longer stalls the rest of the catalog rebuild (spec:150).
        let connecting: Vec<_> = new_by_id
            .iter()
            .filter(|(id, config)| config.enabled && !self.servers.contains_key(*id))
            .map(|(id, config)| {
                let id = id.clone();
                let config = config.clone();
                async move {
                    let result = connect(&config).await;
                    (id, config, result)
                }
            })
            .collect();

        for (id, config, result) in futures_util::future::join_all(connecting).await {
            match result {
                Ok(server) => {
                    self.servers.insert(id.clone(), server);
                    self.configs.insert(id, config);
                }
                Err(e) => {
                    warn!(server_id = %id, error = %e, "tool server unavailable, skipping");
                }
            }
        }

        let mut per_server_tools = Vec::new();
        for entry in self.servers.iter() {
            let id = entry.key().clone();
            let Some(config) = self.configs.get(&id).map(|c| c.clone()) else {
                continue;
            };
            match entry.value().list_tools().await {
                Ok(tools) => per_server_tools.push((config, tools)),
                Err(e) => error!(server_id = %id, error = %e, "list_tools failed"),
            }
        }

        let new_catalog = Arc::new(build_catalog(&per_server_tools));
        info!(tool_count = new_catalog.len(), "tool catalog refreshed");

        // Readers observe either the pre- or post-refresh Arc, never a torn
        // view, since the swap is a single pointer write under the lock.
        let mut guard = self.catalog.write().await;
        *guard = new_catalog;
    }

    /// Invokes a qualified tool, enforcing the per-call timeout and
    /// splitting the structured result into model-visible text plus any
    /// images destined for the next assistant turn.
    pub async fn invoke(
        &self,
        qualified_name: &str,
        mut arguments: Value,
        session_id: &str,
    ) -> std::result::Result<ToolInvocationOutcome, gateway_core::GatewayError> {
        let entry = {
            let catalog = self.catalog.read().await;
            catalog.resolve(qualified_name).cloned()
        };
        let Some(entry) = entry else {
            let err = AggregatorError::UnknownTool(qualified_name.to_string());
            return Err(crate::error::to_tool_failure(qualified_name, &err));
        };

        let Some(server) = self.servers.get(&entry.server_id).map(|e| e.clone()) else {
            let err = AggregatorError::ServerUnavailable {
                server_id: entry.server_id.clone(),
                reason: "server not connected".to_string(),
            };
            return Err(crate::error::to_tool_failure(qualified_name, &err));
        };

        inject_implicit_arguments(&mut arguments, session_id);

        let call = server.call_tool(&entry.raw_name, arguments);
        let outcome = match tokio::time::timeout(self.tool_call_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(crate::error::to_tool_failure(qualified_name, &e)),
            Err(_) => {
                let err = AggregatorError::Timeout(self.tool_call_timeout.as_secs());
                return Err(crate::error::to_tool_failure(qualified_name, &err));
            }
        };

        Ok(split_result(outcome))
    }

    pub async fn shutdown(&self) {
        for entry in self.servers.iter() {
            entry.value().shutdown().await;
        }
    }
}

impl Default for ToolAggregator {
    fn default() -> Self {
        Self::new()
    }
}

async fn connect(config: &ToolServerConfig) -> Result<Arc<dyn ToolServer>> {
    match &config.transport {
        TransportConfig::ModuleEntry { entry_point } => {
            let command = vec![entry_point.clone()];
            let server = StdioToolServer::connect(&config.id, &command).await?;
            Ok(Arc::new(server))
        }
        TransportConfig::CommandVector { command } => {
            let server = StdioToolServer::connect(&config.id, command).await?;
            Ok(Arc::new(server))
        }
        TransportConfig::HttpEndpoint { url } => {
            let server = HttpToolServer::connect(&config.id, url).await?;
            Ok(Arc::new(server))
        }
    }
}

/// Well-known implicit arguments a tool may declare (spec §4.3 "Invocation":
/// "an injection of well-known implicit arguments (e.g., `session_id`)").
fn inject_implicit_arguments(arguments: &mut Value, session_id: &str) {
    if let Value::Object(map) = arguments {
        if map.contains_key("session_id") {
            map.insert("session_id".to_string(), Value::String(session_id.to_string()));
        }
    }
}

/// Converts a tool's structured content parts into one text blob plus a
/// separately-extracted image list (spec §4.3 "Invocation", final bullet).
fn split_result(result: crate::protocol::RawCallResult) -> ToolInvocationOutcome {
    let mut text_parts = Vec::new();
    let mut images = Vec::new();

    for part in result.content {
        match part {
            RawContentPart::Text { text } => text_parts.push(text),
            RawContentPart::ImageUrl { url, mime_type } => images.push(ToolImage { url, mime_type }),
        }
    }

    ToolInvocationOutcome {
        text: text_parts.join("\n"),
        images,
        is_error: result.is_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RawCallResult;

    #[test]
    fn split_result_separates_text_and_images() {
        let result = RawCallResult {
            content: vec![
                RawContentPart::Text { text: "found 2 events".to_string() },
                RawContentPart::ImageUrl {
                    url: "https://example.com/a.png".to_string(),
                    mime_type: Some("image/png".to_string()),
                },
            ],
            is_error: false,
        };
        let outcome = split_result(result);
        assert_eq!(outcome.text, "found 2 events");
        assert_eq!(outcome.images.len(), 1);
        assert!(!outcome.is_error);
    }

    #[tokio::test]
    async fn invoking_unknown_tool_returns_tool_failure() {
        let aggregator = ToolAggregator::new();
        let err = aggregator
            .invoke("does_not_exist", serde_json::json!({}), "session-1")
            .await
            .expect_err("unknown tool must fail");
        match err {
            gateway_core::GatewayError::ToolFailure { tool, .. } => {
                assert_eq!(tool, "does_not_exist");
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    /// Each server's `initialize` handshake sleeps before replying; a
    /// sequential `refresh` over N of them would take N times as long as one
    /// alone. Connecting in parallel keeps the wall clock close to a single
    /// server's delay (spec:150).
    #[tokio::test]
    async fn refresh_connects_newly_enabled_servers_in_parallel() {
        const SLOW_PEER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  sleep 0.3
  printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
done
"#;

        let configs: Vec<ToolServerConfig> = (0..4)
            .map(|i| ToolServerConfig {
                id: format!("slow-{i}"),
                enabled: true,
                transport: TransportConfig::CommandVector {
                    command: vec!["sh".to_string(), "-c".to_string(), SLOW_PEER.to_string()],
                },
                tool_prefix: None,
                disabled_tools: Default::default(),
                tool_overrides: Default::default(),
            })
            .collect();

        let aggregator = ToolAggregator::new();
        let started = std::time::Instant::now();
        aggregator.refresh(configs).await;
        let elapsed = started.elapsed();

        assert_eq!(aggregator.catalog().await.len(), 0);
        assert!(
            elapsed < std::time::Duration::from_secs(1),
            "refresh took {elapsed:?}, connects do not appear to run in parallel"
        );
    }
}
