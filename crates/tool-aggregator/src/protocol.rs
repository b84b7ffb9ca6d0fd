use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 request (spec §6 "Tool-server wire protocol").
#[derive(Debug, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: &'static str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// A tool as reported by `tools/list`, before qualification.
#[derive(Debug, Clone, Deserialize)]
pub struct RawToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// A raw content part as returned by `tools/call` (spec §6: "a list of
/// content parts, each `{type: text | image_url, ...}`").
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawContentPart {
    Text { text: String },
    ImageUrl {
        url: String,
        #[serde(default)]
        mime_type: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCallResult {
    #[serde(default)]
    pub content: Vec<RawContentPart>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}
