use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Persisted configuration for one tool server (spec §3 "Tool Server Config").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub id: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub transport: TransportConfig,
    #[serde(default)]
    pub tool_prefix: Option<String>,
    #[serde(default)]
    pub disabled_tools: HashSet<String>,
    #[serde(default)]
    pub tool_overrides: serde_json::Map<String, serde_json::Value>,
}

fn bool_true() -> bool {
    true
}

/// Exactly one transport variant is populated (spec §3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawned as a child process running a well-known entry point built
    /// into this binary's distribution (e.g. a bundled MCP server).
    ModuleEntry { entry_point: String },
    /// Same stdio protocol, launched with an arbitrary command vector.
    CommandVector { command: Vec<String> },
    /// Remote JSON-RPC over SSE.
    HttpEndpoint { url: String },
}
