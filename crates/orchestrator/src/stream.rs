//! SSE parsing and tool-call assembly for the provider's streaming response
//! (spec §4.2). This module never speaks HTTP directly — it consumes raw
//! text chunks and emits normalized [`StreamEvent`]s; `openai.rs` owns the
//! `reqwest` byte stream and feeds it through here.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::provider::ToolCall;

/// Events emitted to the orchestrator as a turn streams in.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    TextDelta { text: String },

    /// Stream completed. `tool_calls` is non-empty iff `stop_reason` is
    /// `"tool_calls"`.
    Done {
        model: String,
        tokens_in: u32,
        tokens_out: u32,
        stop_reason: String,
        tool_calls: Vec<AssembledToolCall>,
    },

    /// Upstream connection was lost or returned malformed data before a
    /// terminal frame (spec §4.2 "Failure modes").
    Error { message: String },
}

/// A tool call as assembled at end-of-stream. `Malformed` means the
/// concatenated `arguments_buffer` failed to JSON-parse (spec §4.2).
#[derive(Debug, Clone)]
pub enum AssembledToolCall {
    Valid(ToolCall),
    Malformed { id: String, name: String },
}

/// One raw SSE frame: a set of `event:`/`data:`/`id:` lines terminated by a
/// blank line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: Option<String>,
}

/// Literal sentinel signaling end-of-stream (spec §4.2 "Sentinel").
pub const DONE_SENTINEL: &str = "[DONE]";

/// Incremental splitter that turns a chunked byte stream into [`SseFrame`]s.
///
/// Handles chunk boundaries that fall anywhere inside a frame — including
/// inside a CRLF, inside a `data:` line, or exactly at a blank-line
/// terminator — by buffering until a full frame is available (spec §4.2
/// "Input", tested by property 3 in spec §8).
#[derive(Debug, Default)]
pub struct SseFrameSplitter {
    buf: String,
}

impl SseFrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes (as UTF-8 text) into the splitter, returning
    /// any complete frames it now contains. Partial frames remain buffered.
    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buf.push_str(chunk);
        self.buf = self.buf.replace("\r\n", "\n").replace('\r', "\n");

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let frame_text = self.buf[..pos].to_string();
            self.buf.drain(..pos + 2);
            if !frame_text.trim().is_empty() {
                frames.push(parse_frame(&frame_text));
            }
        }
        frames
    }

    /// Flushes any trailing partial frame once the upstream stream ends
    /// (spec §4.2: "MUST flush any final partial frame").
    pub fn finish(mut self) -> Option<SseFrame> {
        let remainder = std::mem::take(&mut self.buf);
        if remainder.trim().is_empty() {
            None
        } else {
            Some(parse_frame(&remainder))
        }
    }
}

fn parse_frame(text: &str) -> SseFrame {
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            frame.event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("id:") {
            frame.id = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }

    if !data_lines.is_empty() {
        frame.data = Some(data_lines.join("\n"));
    }
    frame
}

/// Partial delta shape for `choices[*].delta` in an OpenAI-style streaming
/// chunk (spec §4.2 "Payload decoding").
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: Option<String>,
    name: Option<String>,
    arguments_buffer: String,
}

/// Drives an OpenAI-shaped SSE payload stream to completion, assembling
/// tool-call deltas by index (spec §4.2 "Tool call assembly") and emitting
/// [`StreamEvent`]s. Returns the terminal event (also the last one emitted).
///
/// `frames` yields already-split, non-sentinel `data:` payload strings; the
/// caller (`openai.rs`) is responsible for running frames through
/// [`SseFrameSplitter`] and stopping at [`DONE_SENTINEL`].
pub struct ChunkAssembler {
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    model: String,
    tokens_in: u32,
    tokens_out: u32,
    stop_reason: Option<String>,
}

impl ChunkAssembler {
    pub fn new(model: &str) -> Self {
        Self {
            tool_calls: BTreeMap::new(),
            model: model.to_string(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: None,
        }
    }

    /// Feeds one non-sentinel `data:` payload. Returns a `TextDelta` event
    /// when the chunk carries content; malformed JSON is logged and skipped
    /// per spec §4.2 "Failure modes" (it does not abort the turn).
    pub fn feed(&mut self, payload: &str) -> Option<StreamEvent> {
        let chunk: ChatCompletionChunk = match serde_json::from_str(payload) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed stream chunk");
                return None;
            }
        };

        if let Some(model) = chunk.model {
            self.model = model;
        }
        if let Some(usage) = chunk.usage {
            self.tokens_in = usage.prompt_tokens;
            self.tokens_out = usage.completion_tokens;
        }

        let choice = chunk.choices.into_iter().next()?;
        if let Some(reason) = choice.finish_reason {
            self.stop_reason = Some(reason);
        }

        for delta in choice.delta.tool_calls {
            let entry = self.tool_calls.entry(delta.index).or_default();
            if let Some(id) = delta.id {
                if !id.is_empty() && entry.id.as_deref().unwrap_or("").is_empty() {
                    entry.id = Some(id);
                }
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    if !name.is_empty() && entry.name.as_deref().unwrap_or("").is_empty() {
                        entry.name = Some(name);
                    }
                }
                if let Some(args) = function.arguments {
                    entry.arguments_buffer.push_str(&args);
                }
            }
        }

        choice.delta.content.map(|text| StreamEvent::TextDelta { text })
    }

    /// Finalizes the turn: parses each accumulated `arguments_buffer` once
    /// (spec §9 "Partial JSON reassembly" — never incrementally).
    pub fn finish(self) -> StreamEvent {
        let stop_reason = self.stop_reason.unwrap_or_else(|| "stop".to_string());
        let tool_calls: Vec<AssembledToolCall> = self
            .tool_calls
            .into_iter()
            .map(|(_, acc)| {
                let id = acc.id.unwrap_or_default();
                let name = acc.name.unwrap_or_default();
                match serde_json::from_str::<serde_json::Value>(&acc.arguments_buffer) {
                    Ok(arguments) => AssembledToolCall::Valid(ToolCall { id, name, arguments }),
                    Err(_) => AssembledToolCall::Malformed { id, name },
                }
            })
            .collect();

        StreamEvent::Done {
            model: self.model,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            stop_reason,
            tool_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_frame() {
        let mut splitter = SseFrameSplitter::new();
        let frames = splitter.push("event: message\ndata: hello\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data.as_deref(), Some("hello"));
    }

    #[test]
    fn concatenates_multiple_data_lines() {
        let mut splitter = SseFrameSplitter::new();
        let frames = splitter.push("data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data.as_deref(), Some("line1\nline2"));
    }

    #[test]
    fn buffers_across_arbitrary_chunk_boundaries() {
        let whole = "data: {\"a\":1}\n\ndata: {\"b\":2}\n\n";
        for split_at in 0..whole.len() {
            let (a, b) = whole.split_at(split_at);
            let mut splitter = SseFrameSplitter::new();
            let mut frames = splitter.push(a);
            frames.extend(splitter.push(b));
            assert_eq!(frames.len(), 2, "failed at split {split_at}");
            assert_eq!(frames[0].data.as_deref(), Some("{\"a\":1}"));
            assert_eq!(frames[1].data.as_deref(), Some("{\"b\":2}"));
        }
    }

    #[test]
    fn normalizes_crlf_before_splitting() {
        let mut splitter = SseFrameSplitter::new();
        let frames = splitter.push("data: hi\r\n\r\n");
        assert_eq!(frames[0].data.as_deref(), Some("hi"));
    }

    #[test]
    fn flushes_trailing_partial_frame_on_finish() {
        let mut splitter = SseFrameSplitter::new();
        assert!(splitter.push("data: partial").is_empty());
        let flushed = splitter.finish().expect("partial frame should flush");
        assert_eq!(flushed.data.as_deref(), Some("partial"));
    }

    #[test]
    fn assembles_tool_call_arguments_across_deltas() {
        let mut assembler = ChunkAssembler::new("test-model");
        assembler.feed(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"search","arguments":"{\"q"}}]}}]}"#,
        );
        assembler.feed(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\":\"cats\"}"}}]}}]}"#,
        );
        assembler.feed(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        let done = assembler.finish();
        match done {
            StreamEvent::Done { tool_calls, stop_reason, .. } => {
                assert_eq!(stop_reason, "tool_calls");
                assert_eq!(tool_calls.len(), 1);
                match &tool_calls[0] {
                    AssembledToolCall::Valid(tc) => {
                        assert_eq!(tc.id, "c1");
                        assert_eq!(tc.name, "search");
                        assert_eq!(tc.arguments["q"], "cats");
                    }
                    AssembledToolCall::Malformed { .. } => panic!("expected valid tool call"),
                }
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn marks_unparseable_arguments_as_malformed() {
        let mut assembler = ChunkAssembler::new("test-model");
        assembler.feed(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c2","function":{"name":"x","arguments":"{bad"}}]}}]}"#,
        );
        assembler.feed(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        match assembler.finish() {
            StreamEvent::Done { tool_calls, .. } => {
                assert!(matches!(tool_calls[0], AssembledToolCall::Malformed { .. }));
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn first_non_empty_id_and_name_are_not_overwritten() {
        let mut assembler = ChunkAssembler::new("test-model");
        assembler.feed(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"first","function":{"name":"real_name","arguments":"{}"}}]}}]}"#,
        );
        assembler.feed(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"","function":{"name":""}}]}}]}"#,
        );
        assembler.feed(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        match assembler.finish() {
            StreamEvent::Done { tool_calls, .. } => match &tool_calls[0] {
                AssembledToolCall::Valid(tc) => {
                    assert_eq!(tc.id, "first");
                    assert_eq!(tc.name, "real_name");
                }
                AssembledToolCall::Malformed { .. } => panic!("expected valid"),
            },
            _ => panic!("expected Done"),
        }
    }
}
