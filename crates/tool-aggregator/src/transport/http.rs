//! HTTP/SSE JSON-RPC transport (spec §4.3 "HTTP/SSE endpoint"). Each RPC call
//! is a POST carrying the JSON-RPC request; the response arrives as a single
//! SSE frame whose `data:` payload is the JSON-RPC response object.
//!
//! The frame-buffering technique mirrors `orchestrator::stream`'s
//! `SseFrameSplitter`, reimplemented locally to keep `tool-aggregator` from
//! depending on `orchestrator` (the dependency direction runs the other way).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{AggregatorError, Result};
use crate::protocol::{RawCallResult, RawToolSpec, RpcRequest, RpcResponse};
use crate::transport::ToolServer;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;
const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 2;

pub struct HttpToolServer {
    server_id: String,
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpToolServer {
    pub async fn connect(server_id: &str, url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| AggregatorError::Transport(e.to_string()))?;

        let server = Self {
            server_id: server_id.to_string(),
            url: url.to_string(),
            client,
            next_id: AtomicU64::new(1),
        };

        let mut last_err = None;
        for attempt in 0..DEFAULT_RECONNECT_ATTEMPTS {
            match server
                .call("initialize", json!({ "protocolVersion": "2025-06-18", "capabilities": {} }))
                .await
            {
                Ok(_) => return Ok(server),
                Err(e) => {
                    warn!(server_id, attempt, error = %e, "connect attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(DEFAULT_RECONNECT_INTERVAL_SECS)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AggregatorError::ServerUnavailable {
            server_id: server_id.to_string(),
            reason: "exhausted reconnect budget".to_string(),
        }))
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params);

        let resp = self
            .client
            .post(&self.url)
            .header("accept", "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| AggregatorError::ServerUnavailable {
                server_id: self.server_id.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(AggregatorError::Transport(format!(
                "HTTP {} from tool server",
                resp.status()
            )));
        }

        let payload = read_first_sse_data_frame(resp)
            .await
            .ok_or_else(|| AggregatorError::Transport("empty SSE response".to_string()))?;

        let response: RpcResponse = serde_json::from_str(&payload)
            .map_err(|e| AggregatorError::Transport(format!("bad response JSON: {e}")))?;

        if let Some(err) = response.error {
            return Err(AggregatorError::Transport(format!(
                "{} ({})",
                err.message, err.code
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

/// Buffers the byte stream until the first complete `data:` frame is seen,
/// normalizing CRLF and tolerating arbitrary chunk boundaries the same way
/// `orchestrator::stream::SseFrameSplitter` does.
async fn read_first_sse_data_frame(resp: reqwest::Response) -> Option<String> {
    let mut buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.ok()?;
        let text = std::str::from_utf8(&chunk).ok()?;
        buf.push_str(text);
        buf = buf.replace("\r\n", "\n").replace('\r', "\n");

        if let Some(pos) = buf.find("\n\n") {
            let frame = &buf[..pos];
            let data: String = frame
                .lines()
                .filter_map(|l| l.strip_prefix("data:"))
                .map(|l| l.strip_prefix(' ').unwrap_or(l))
                .collect::<Vec<_>>()
                .join("\n");
            if !data.is_empty() {
                return Some(data);
            }
        }
    }
    None
}

#[async_trait]
impl ToolServer for HttpToolServer {
    async fn list_tools(&self) -> Result<Vec<RawToolSpec>> {
        let result = self.call("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| AggregatorError::MalformedResult("missing 'tools' field".to_string()))?;
        serde_json::from_value(tools)
            .map_err(|e| AggregatorError::MalformedResult(format!("bad tool spec: {e}")))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<RawCallResult> {
        let result = self
            .call("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| AggregatorError::MalformedResult(format!("bad call result: {e}")))
    }

    async fn shutdown(&self) {
        // Stateless HTTP connections — nothing to tear down.
    }
}
