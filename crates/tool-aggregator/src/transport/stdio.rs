//! Child-process JSON-RPC transport, one line per message (spec §6
//! "child-process stdio with newline-delimited framing"). Grounded in the
//! *server* side of this wire format — read a line, parse as
//! `serde_json::Value`, dispatch on `method` — inverted into a client that
//! writes requests and reads responses over a spawned child's stdio.
//!
//! Shared by both the `module_entry` and `command_vector` server variants;
//! they differ only in how the command is constructed.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{AggregatorError, Result};
use crate::protocol::{RawCallResult, RawToolSpec, RpcRequest, RpcResponse};
use crate::transport::ToolServer;

/// Stdin/stdout held behind a single lock so a full request/response round
/// trip is atomic — two concurrent calls can never interleave their writes
/// or each read the other's response line (spec §5: "their stdio pipes are
/// serialized per-server, one in-flight RPC at a time").
struct StdioHandles {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

pub struct StdioToolServer {
    server_id: String,
    child: Mutex<Child>,
    io: Mutex<StdioHandles>,
    next_id: AtomicU64,
}

impl StdioToolServer {
    /// Spawns `command` and performs the `initialize` handshake, bounded by
    /// `DEFAULT_TOOL_SERVER_CONNECT_TIMEOUT_SECS` so a server that hangs
    /// mid-spawn or mid-handshake can't stall a catalog refresh that's
    /// connecting to several servers at once.
    pub async fn connect(server_id: &str, command: &[String]) -> Result<Self> {
        let timeout = std::time::Duration::from_secs(
            gateway_core::config::DEFAULT_TOOL_SERVER_CONNECT_TIMEOUT_SECS,
        );
        match tokio::time::timeout(timeout, Self::connect_inner(server_id, command)).await {
            Ok(result) => result,
            Err(_) => Err(AggregatorError::Timeout(timeout.as_secs())),
        }
    }

    async fn connect_inner(server_id: &str, command: &[String]) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            AggregatorError::Config(format!("server '{server_id}': empty command vector"))
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AggregatorError::ServerUnavailable {
                server_id: server_id.to_string(),
                reason: format!("spawn failed: {e}"),
            })?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let server = Self {
            server_id: server_id.to_string(),
            child: Mutex::new(child),
            io: Mutex::new(StdioHandles {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            next_id: AtomicU64::new(1),
        };

        server
            .call(
                "initialize",
                json!({ "protocolVersion": "2025-06-18", "capabilities": {} }),
            )
            .await?;

        Ok(server)
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request)
            .map_err(|e| AggregatorError::Transport(e.to_string()))?;
        line.push('\n');

        // One lock spans the write and its matching read, so a second
        // concurrent `call` can't interleave a write between this one's
        // write and read, nor steal this one's response line.
        let mut io = self.io.lock().await;

        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AggregatorError::Transport(e.to_string()))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| AggregatorError::Transport(e.to_string()))?;

        let mut response_line = String::new();
        let n = io
            .stdout
            .read_line(&mut response_line)
            .await
            .map_err(|e| AggregatorError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(AggregatorError::ServerUnavailable {
                server_id: self.server_id.clone(),
                reason: "child closed stdout".to_string(),
            });
        }

        drop(io);

        let response: RpcResponse = serde_json::from_str(response_line.trim())
            .map_err(|e| AggregatorError::Transport(format!("bad response JSON: {e}")))?;

        match response.id {
            Some(Value::Number(n)) if n.as_u64() == Some(id) => {}
            other => {
                return Err(AggregatorError::Transport(format!(
                    "response id mismatch: expected {id}, got {other:?}"
                )))
            }
        }

        if let Some(err) = response.error {
            return Err(AggregatorError::Transport(format!(
                "{} ({})",
                err.message, err.code
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ToolServer for StdioToolServer {
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
        // Dropping stdin closes the child's input pipe, which well-behaved
        // MCP-style servers treat as EOF and exit on their own (spec §4.3
        // "gracefully shut down ... SIGTERM then hard kill after grace").
        // Without pulling in a signal-sending crate outside the teacher's
        // stack, EOF-then-grace-period-then-kill is the closest equivalent.
        {
            let mut io = self.io.lock().await;
            let _ = io.stdin.shutdown().await;
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(server_id = %self.server_id, "tool server did not exit gracefully, killing");
                let _ = child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scripted JSON-RPC peer: answers `initialize` with its own id, and
    /// `tools/call` by echoing the call's `tag` argument back as text
    /// content, so a test can tell which request a response belongs to.
    const ECHO_PEER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"tools/call"'*)
      tag=$(printf '%s' "$line" | sed -n 's/.*"tag":"\([a-zA-Z0-9]*\)".*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s"}],"isError":false}}\n' "$id" "$tag"
      ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
  esac
done
"#;

    async fn echo_peer() -> StdioToolServer {
        StdioToolServer::connect("echo", &["sh".to_string(), "-c".to_string(), ECHO_PEER.to_string()])
            .await
            .expect("scripted peer should complete the initialize handshake")
    }

    #[tokio::test]
    async fn connect_performs_initialize_handshake() {
        echo_peer().await;
    }

    #[tokio::test]
    async fn call_rejects_a_response_whose_id_does_not_match_the_request() {
        const LYING_PEER: &str = r#"
while IFS= read -r _line; do
  printf '{"jsonrpc":"2.0","id":999999,"result":{}}\n'
done
"#;
        let server = StdioToolServer::connect(
            "liar",
            &["sh".to_string(), "-c".to_string(), LYING_PEER.to_string()],
        )
        .await;
        // The handshake's own `initialize` call already gets the wrong id
        // back, so `connect` itself must fail with a transport error rather
        // than silently accepting a response meant for a different call.
        let err = server.unwrap_err();
        assert!(matches!(err, AggregatorError::Transport(msg) if msg.contains("id mismatch")));
    }

    #[tokio::test]
    async fn concurrent_calls_never_cross_wires_on_the_same_server() {
        let server = std::sync::Arc::new(echo_peer().await);

        let mut handles = Vec::new();
        for tag in ["alpha", "bravo", "charlie", "delta"] {
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                let result = server
                    .call_tool(tag, json!({ "tag": tag }))
                    .await
                    .expect("call should succeed");
                let text = match &result.content[0] {
                    crate::protocol::RawContentPart::Text { text } => text.clone(),
                    other => panic!("unexpected content part: {other:?}"),
                };
                assert_eq!(text, tag, "response content crossed wires with another call");
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }
}
