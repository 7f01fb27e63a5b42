// Anthropic messages protocol
//
// Requests are decoded with typed serde structs (extra fields ignored, so
// this stays robust to API additions). Streaming responses use named SSE
// events; assembly tracks content blocks by index and accumulates text and
// tool-argument deltas until the stream terminates.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use super::sse::SseFramer;
use super::{Assembly, FrameEvent};
use crate::model::{ImageMeta, MessageEntry, RequestSummary, ToolCall, Usage};

// ============================================================================
// Request parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(default)]
    system: Option<Value>,
    #[serde(default)]
    tools: Vec<Value>,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Message {
    role: String,
    content: MessageContent,
}

/// Message content can be a string or an array of content blocks
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image")]
    Image { source: ImageSource },

    /// Catch-all for block types we don't summarize (tool_use, tool_result,
    /// thinking, documents, ...)
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

pub fn parse_request(body: &[u8]) -> RequestSummary {
    let request: ApiRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            tracing::debug!("Anthropic request body not parseable: {}", e);
            return RequestSummary::default();
        }
    };

    let system_prompt = request.system.as_ref().and_then(flatten_system);

    let mut messages = Vec::with_capacity(request.messages.len());
    let mut image_metadata = Vec::new();
    let mut image_index = 0usize;

    for msg in &request.messages {
        let content = match &msg.content {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => parts.push(text.as_str()),
                        ContentBlock::Image { source } => {
                            image_metadata.push(image_meta(image_index, source));
                            image_index += 1;
                        }
                        ContentBlock::Other => {}
                    }
                }
                parts.join("\n")
            }
        };
        messages.push(MessageEntry {
            role: msg.role.clone(),
            content,
        });
    }

    RequestSummary {
        model: Some(request.model),
        system_prompt,
        messages,
        tools: request.tools,
        image_metadata,
        stream_requested: request.stream.unwrap_or(false),
    }
}

/// The system prompt is either a plain string or an array of text blocks
fn flatten_system(system: &Value) -> Option<String> {
    match system {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| {
                    if b.get("type")?.as_str()? == "text" {
                        b.get("text")?.as_str()
                    } else {
                        None
                    }
                })
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

/// Record position, mime, and decoded size - never the base64 payload
fn image_meta(index: usize, source: &ImageSource) -> ImageMeta {
    let size_bytes = source
        .data
        .as_ref()
        .map(|d| d.len() * 3 / 4)
        .unwrap_or(0);
    ImageMeta {
        index,
        mime: source
            .media_type
            .clone()
            .unwrap_or_else(|| source.kind.clone()),
        size_bytes,
    }
}

// ============================================================================
// Streaming assembly
// ============================================================================

/// Accumulator for one content block, keyed by stream index
#[derive(Debug)]
enum BlockAcc {
    Text(String),
    Thinking(String),
    ToolUse {
        id: Option<String>,
        name: String,
        arguments: String,
    },
}

#[derive(Debug, Default)]
pub struct AnthropicStream {
    framer: SseFramer,
    model: Option<String>,
    blocks: BTreeMap<u64, BlockAcc>,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    stop_reason: Option<String>,
    error: Option<String>,
    /// Running byte length of assembled text content (for time-to-first-token)
    text_len: usize,
}

impl AnthropicStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        let frames = self.framer.push(bytes);
        let mut events = Vec::with_capacity(frames.len());

        for frame in frames {
            if frame.data.is_empty() {
                // Keep-alive comments and bare event lines still count as
                // received frames
                events.push(FrameEvent {
                    event_type: frame.event.unwrap_or_else(|| "comment".to_string()),
                    raw: frame.raw,
                    decoded: None,
                });
                continue;
            }

            let data: Value = match serde_json::from_str(&frame.data) {
                Ok(v) => v,
                Err(_) => {
                    events.push(FrameEvent::malformed(frame.raw));
                    continue;
                }
            };

            let event_type = frame
                .event
                .or_else(|| data.get("type").and_then(|t| t.as_str()).map(String::from))
                .unwrap_or_else(|| "chunk".to_string());

            self.apply(&event_type, &data);

            events.push(FrameEvent {
                event_type,
                raw: frame.raw,
                decoded: Some(data),
            });
        }

        events
    }

    /// Apply one decoded event to the assembly state
    fn apply(&mut self, event_type: &str, data: &Value) {
        match event_type {
            "message_start" => {
                if let Some(message) = data.get("message") {
                    self.model = message
                        .get("model")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    self.input_tokens = message
                        .get("usage")
                        .and_then(|u| u.get("input_tokens"))
                        .and_then(|v| v.as_u64())
                        .map(|v| v as u32);
                }
            }
            "content_block_start" => {
                let Some(index) = data.get("index").and_then(|v| v.as_u64()) else {
                    return;
                };
                let Some(block) = data.get("content_block") else {
                    return;
                };
                let acc = match block.get("type").and_then(|t| t.as_str()) {
                    Some("tool_use") => BlockAcc::ToolUse {
                        id: block.get("id").and_then(|v| v.as_str()).map(String::from),
                        name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: String::new(),
                    },
                    Some("thinking") => BlockAcc::Thinking(String::new()),
                    // text, and any future block kind, accumulate as text;
                    // an initial "text" field (unusual but legal) is kept
                    _ => {
                        let initial = block
                            .get("text")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        self.text_len += initial.len();
                        BlockAcc::Text(initial.to_string())
                    }
                };
                self.blocks.insert(index, acc);
            }
            "content_block_delta" => {
                let Some(index) = data.get("index").and_then(|v| v.as_u64()) else {
                    return;
                };
                let Some(delta) = data.get("delta") else {
                    return;
                };
                let Some(acc) = self.blocks.get_mut(&index) else {
                    return;
                };
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        if let (BlockAcc::Text(buf), Some(text)) =
                            (acc, delta.get("text").and_then(|v| v.as_str()))
                        {
                            buf.push_str(text);
                            self.text_len += text.len();
                        }
                    }
                    Some("input_json_delta") => {
                        if let (BlockAcc::ToolUse { arguments, .. }, Some(partial)) =
                            (acc, delta.get("partial_json").and_then(|v| v.as_str()))
                        {
                            arguments.push_str(partial);
                        }
                    }
                    Some("thinking_delta") => {
                        if let (BlockAcc::Thinking(buf), Some(text)) =
                            (acc, delta.get("thinking").and_then(|v| v.as_str()))
                        {
                            buf.push_str(text);
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(delta) = data.get("delta") {
                    if let Some(reason) = delta.get("stop_reason").and_then(|v| v.as_str()) {
                        self.stop_reason = Some(reason.to_string());
                    }
                }
                if let Some(tokens) = data
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                {
                    self.output_tokens = Some(tokens as u32);
                }
            }
            "error" => {
                let message = data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| data.to_string());
                self.error = Some(message);
            }
            // content_block_stop, message_stop, ping: no state change
            _ => {}
        }
    }

    pub fn take_tail(&mut self) -> Option<Bytes> {
        self.framer.take_tail()
    }

    pub fn content_len(&self) -> usize {
        self.text_len
    }

    pub fn finalize(&mut self) -> Assembly {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut saw_text = false;

        for acc in self.blocks.values() {
            match acc {
                BlockAcc::Text(buf) => {
                    saw_text = true;
                    text.push_str(buf);
                }
                BlockAcc::ToolUse {
                    id,
                    name,
                    arguments,
                } => tool_calls.push(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: parse_tool_arguments(arguments),
                }),
                BlockAcc::Thinking(_) => {}
            }
        }

        Assembly {
            model: self.model.clone(),
            reconstructed_text: saw_text.then_some(text),
            tool_calls,
            usage: Usage {
                prompt_tokens: self.input_tokens,
                completion_tokens: self.output_tokens,
                ..Default::default()
            },
            finish_reason: self.stop_reason.clone(),
            error: self.error.clone(),
        }
    }
}

/// Accumulated tool-argument JSON; kept as a string value when unparseable
/// so partial captures survive client disconnects
fn parse_tool_arguments(buf: &str) -> Value {
    if buf.is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(buf).unwrap_or_else(|_| Value::String(buf.to_string()))
}

// ============================================================================
// Non-streaming responses
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ResponseUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

pub fn parse_response(status: u16, body: &[u8]) -> Assembly {
    if status >= 400 {
        return Assembly {
            error: Some(extract_error(body)),
            ..Default::default()
        };
    }

    let response: ApiResponse = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!("Anthropic response body not parseable: {}", e);
            return Assembly::default();
        }
    };

    let mut text = String::new();
    let mut saw_text = false;
    let mut tool_calls = Vec::new();
    for block in &response.content {
        match block {
            ResponseBlock::Text { text: t } => {
                saw_text = true;
                text.push_str(t);
            }
            ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: Some(id.clone()),
                name: name.clone(),
                arguments: input.clone(),
            }),
            ResponseBlock::Other => {}
        }
    }

    let usage = response.usage.as_ref();
    Assembly {
        model: response.model.clone(),
        reconstructed_text: saw_text.then_some(text),
        tool_calls,
        usage: Usage {
            prompt_tokens: usage.and_then(|u| u.input_tokens),
            completion_tokens: usage.and_then(|u| u.output_tokens),
            ..Default::default()
        },
        finish_reason: response.stop_reason,
        error: None,
    }
}

/// Error bodies look like {"type":"error","error":{"type":...,"message":...}}
fn extract_error(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")?
                .get("message")?
                .as_str()
                .map(String::from)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(event: &str, data: &str) -> String {
        format!("event: {}\ndata: {}\n\n", event, data)
    }

    #[test]
    fn request_summary_extracts_semantics() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-5",
            "system": "be terse",
            "max_tokens": 1024,
            "stream": true,
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}],
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aaaabbbb"}}
                ]}
            ]
        });
        let summary = parse_request(serde_json::to_vec(&body).unwrap().as_slice());
        assert_eq!(summary.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(summary.system_prompt.as_deref(), Some("be terse"));
        assert!(summary.stream_requested);
        assert_eq!(summary.messages.len(), 2);
        assert_eq!(summary.messages[1].content, "what is this");
        assert_eq!(summary.tools.len(), 1);
        assert_eq!(summary.image_metadata.len(), 1);
        assert_eq!(summary.image_metadata[0].mime, "image/png");
        assert_eq!(summary.image_metadata[0].size_bytes, 6);
    }

    #[test]
    fn stream_assembles_hello() {
        // The canonical seven-event stream
        let mut s = AnthropicStream::new();
        let mut stream = String::new();
        stream += &sse(
            "message_start",
            r#"{"type":"message_start","message":{"model":"claude-sonnet-4-5","usage":{"input_tokens":12}}}"#,
        );
        stream += &sse(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        );
        stream += &sse(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
        );
        stream += &sse(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
        );
        stream += &sse("content_block_stop", r#"{"type":"content_block_stop","index":0}"#);
        stream += &sse(
            "message_delta",
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
        );
        stream += &sse("message_stop", r#"{"type":"message_stop"}"#);

        let events = s.feed(stream.as_bytes());
        assert_eq!(events.len(), 7);
        assert_eq!(events[0].event_type, "message_start");
        assert_eq!(events[6].event_type, "message_stop");

        let assembly = s.finalize();
        assert_eq!(assembly.reconstructed_text.as_deref(), Some("Hello"));
        assert_eq!(assembly.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(assembly.usage.prompt_tokens, Some(12));
        assert_eq!(assembly.usage.completion_tokens, Some(2));
        assert_eq!(assembly.finish_reason.as_deref(), Some("end_turn"));
        assert!(assembly.error.is_none());
    }

    #[test]
    fn stream_resumes_across_split_frames() {
        let mut s = AnthropicStream::new();
        let full = sse(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#,
        ) + &sse(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"AB"}}"#,
        );
        let bytes = full.as_bytes();
        // Split mid-frame
        let cut = bytes.len() / 2;
        let first = s.feed(&bytes[..cut]);
        let second = s.feed(&bytes[cut..]);
        assert_eq!(first.len() + second.len(), 2);
        assert_eq!(s.finalize().reconstructed_text.as_deref(), Some("AB"));
    }

    #[test]
    fn tool_use_arguments_accumulate_as_json() {
        let mut s = AnthropicStream::new();
        let mut stream = String::new();
        stream += &sse(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"get_weather"}}"#,
        );
        stream += &sse(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"city\":"}}"#,
        );
        stream += &sse(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"Oslo\"}"}}"#,
        );
        stream += &sse("content_block_stop", r#"{"type":"content_block_stop","index":0}"#);
        s.feed(stream.as_bytes());

        let assembly = s.finalize();
        assert_eq!(assembly.tool_calls.len(), 1);
        let call = &assembly.tool_calls[0];
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.id.as_deref(), Some("tu_1"));
        assert_eq!(call.arguments, serde_json::json!({"city": "Oslo"}));
    }

    #[test]
    fn malformed_frame_does_not_abort_assembly() {
        let mut s = AnthropicStream::new();
        let mut stream = String::new();
        stream += &sse(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#,
        );
        stream += "data: {not json\n\n";
        stream += &sse(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ok"}}"#,
        );
        let events = s.feed(stream.as_bytes());
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].event_type, "malformed");
        assert!(events[1].decoded.is_none());
        assert_eq!(s.finalize().reconstructed_text.as_deref(), Some("ok"));
    }

    #[test]
    fn error_event_populates_error() {
        let mut s = AnthropicStream::new();
        let stream = sse(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        s.feed(stream.as_bytes());
        let assembly = s.finalize();
        assert_eq!(assembly.error.as_deref(), Some("Overloaded"));
    }

    #[test]
    fn non_stream_response_parses() {
        let body = serde_json::json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-5",
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "tu_9", "name": "ls", "input": {"path": "/"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 7, "output_tokens": 11}
        });
        let assembly = parse_response(200, serde_json::to_vec(&body).unwrap().as_slice());
        assert_eq!(assembly.reconstructed_text.as_deref(), Some("hello"));
        assert_eq!(assembly.tool_calls.len(), 1);
        assert_eq!(assembly.finish_reason.as_deref(), Some("tool_use"));
        assert_eq!(assembly.usage.prompt_tokens, Some(7));
        assert_eq!(assembly.usage.completion_tokens, Some(11));
    }

    #[test]
    fn error_status_extracts_message() {
        let body = br#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        let assembly = parse_response(401, body);
        assert_eq!(assembly.error.as_deref(), Some("invalid x-api-key"));
    }
}
