// Ollama NDJSON protocol
//
// Both /api/generate and /api/chat stream one JSON object per line. Text is
// carried in `.response` (generate) or `.message.content` (chat) and is
// concatenated until an object with `done: true` arrives, which also carries
// the eval counters that map onto token usage. Absent a `stream` field,
// Ollama streams by default - the opposite of the other providers.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use serde_json::Value;

use super::{Assembly, FrameEvent};
use crate::model::{ImageMeta, MessageEntry, RequestSummary, ToolCall, Usage};

// ============================================================================
// Request parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiRequest {
    model: String,
    /// /api/generate
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    system: Option<String>,
    /// Base64 payloads on /api/generate
    #[serde(default)]
    images: Vec<String>,
    /// /api/chat
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    tools: Vec<Value>,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Message {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    images: Vec<String>,
}

pub fn parse_request(body: &[u8]) -> RequestSummary {
    let request: ApiRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            tracing::debug!("Ollama request body not parseable: {}", e);
            return RequestSummary::default();
        }
    };

    let mut messages = Vec::new();
    let mut image_metadata = Vec::new();
    let mut image_index = 0usize;

    // Chat endpoint carries a message list; generate carries a bare prompt
    if !request.messages.is_empty() {
        for msg in &request.messages {
            for data in &msg.images {
                image_metadata.push(base64_image_meta(image_index, data));
                image_index += 1;
            }
            messages.push(MessageEntry {
                role: msg.role.clone(),
                content: msg.content.clone(),
            });
        }
    } else if let Some(prompt) = &request.prompt {
        for data in &request.images {
            image_metadata.push(base64_image_meta(image_index, data));
            image_index += 1;
        }
        messages.push(MessageEntry {
            role: "user".to_string(),
            content: prompt.clone(),
        });
    }

    RequestSummary {
        model: Some(request.model),
        system_prompt: request.system,
        messages,
        tools: request.tools,
        image_metadata,
        // Ollama streams unless told otherwise
        stream_requested: request.stream.unwrap_or(true),
    }
}

/// Ollama sends bare base64 with no media type; the decoded size is all the
/// metadata there is
fn base64_image_meta(index: usize, data: &str) -> ImageMeta {
    ImageMeta {
        index,
        mime: "application/octet-stream".to_string(),
        size_bytes: data.len() * 3 / 4,
    }
}

// ============================================================================
// Streaming assembly
// ============================================================================

#[derive(Debug, Default)]
pub struct OllamaStream {
    buf: BytesMut,
    model: Option<String>,
    text: String,
    tool_calls: Vec<ToolCall>,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    error: Option<String>,
}

impl OllamaStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        self.buf.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(end) = find_newline(&self.buf) {
            let raw = self.buf.split_to(end).freeze();
            events.push(self.decode_line(raw));
        }
        events
    }

    fn decode_line(&mut self, raw: Bytes) -> FrameEvent {
        let text = String::from_utf8_lossy(&raw);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return FrameEvent {
                event_type: "blank".to_string(),
                raw,
                decoded: None,
            };
        }

        let data: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => return FrameEvent::malformed(raw),
        };

        let done = data.get("done").and_then(|v| v.as_bool()).unwrap_or(false);
        self.apply(&data, done);

        FrameEvent {
            event_type: if done { "done" } else { "chunk" }.to_string(),
            raw,
            decoded: Some(data),
        }
    }

    fn apply(&mut self, data: &Value, done: bool) {
        if self.model.is_none() {
            self.model = data.get("model").and_then(|v| v.as_str()).map(String::from);
        }

        if let Some(err) = data.get("error").and_then(|v| v.as_str()) {
            self.error = Some(err.to_string());
        }

        // generate: .response; chat: .message.content
        if let Some(fragment) = data.get("response").and_then(|v| v.as_str()) {
            self.text.push_str(fragment);
        } else if let Some(message) = data.get("message") {
            if let Some(fragment) = message.get("content").and_then(|v| v.as_str()) {
                self.text.push_str(fragment);
            }
            if let Some(calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
                for call in calls {
                    if let Some(function) = call.get("function") {
                        self.tool_calls.push(ToolCall {
                            id: None,
                            name: function
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            arguments: function
                                .get("arguments")
                                .cloned()
                                .unwrap_or(Value::Null),
                        });
                    }
                }
            }
        }

        if done {
            self.done_reason = data
                .get("done_reason")
                .and_then(|v| v.as_str())
                .map(String::from)
                .or_else(|| Some("stop".to_string()));
            self.prompt_eval_count = data
                .get("prompt_eval_count")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .or(self.prompt_eval_count);
            self.eval_count = data
                .get("eval_count")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .or(self.eval_count);
        }
    }

    pub fn take_tail(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }

    pub fn content_len(&self) -> usize {
        self.text.len()
    }

    pub fn finalize(&mut self) -> Assembly {
        Assembly {
            model: self.model.clone(),
            reconstructed_text: (!self.text.is_empty()).then(|| self.text.clone()),
            tool_calls: self.tool_calls.clone(),
            usage: Usage {
                prompt_tokens: self.prompt_eval_count,
                completion_tokens: self.eval_count,
                ..Default::default()
            },
            finish_reason: self.done_reason.clone(),
            error: self.error.clone(),
        }
    }
}

/// Position just past the next newline
fn find_newline(buf: &BytesMut) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n').map(|pos| pos + 1)
}

// ============================================================================
// Non-streaming responses
// ============================================================================

pub fn parse_response(status: u16, body: &[u8]) -> Assembly {
    if status >= 400 {
        let message = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("error")?.as_str().map(String::from))
            .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
        return Assembly {
            error: Some(message),
            ..Default::default()
        };
    }

    // A non-streaming body is the same object shape as the final NDJSON line
    let mut stream = OllamaStream::new();
    if let Ok(data) = serde_json::from_slice::<Value>(body) {
        let done = data.get("done").and_then(|v| v.as_bool()).unwrap_or(true);
        stream.apply(&data, done);
    } else {
        tracing::debug!("Ollama response body not parseable");
    }
    stream.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_request_summary() {
        let body = serde_json::json!({
            "model": "llama3.2",
            "prompt": "why is the sky blue?",
            "system": "answer briefly",
            "images": ["QUJDRA=="]
        });
        let summary = parse_request(serde_json::to_vec(&body).unwrap().as_slice());
        assert_eq!(summary.model.as_deref(), Some("llama3.2"));
        assert_eq!(summary.system_prompt.as_deref(), Some("answer briefly"));
        assert_eq!(summary.messages.len(), 1);
        assert_eq!(summary.messages[0].role, "user");
        assert_eq!(summary.image_metadata.len(), 1);
        // Streaming is the default when the field is absent
        assert!(summary.stream_requested);
    }

    #[test]
    fn chat_request_summary() {
        let body = serde_json::json!({
            "model": "llama3.2",
            "stream": false,
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi there"}
            ]
        });
        let summary = parse_request(serde_json::to_vec(&body).unwrap().as_slice());
        assert_eq!(summary.messages.len(), 2);
        assert!(!summary.stream_requested);
    }

    #[test]
    fn ndjson_stream_concatenates_until_done() {
        let mut s = OllamaStream::new();
        let events = s.feed(
            b"{\"model\":\"llama3.2\",\"response\":\"A\",\"done\":false}\n{\"response\":\"B\",\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":4,\"eval_count\":2}\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "chunk");
        assert_eq!(events[1].event_type, "done");

        let assembly = s.finalize();
        assert_eq!(assembly.reconstructed_text.as_deref(), Some("AB"));
        assert_eq!(assembly.model.as_deref(), Some("llama3.2"));
        assert_eq!(assembly.usage.prompt_tokens, Some(4));
        assert_eq!(assembly.usage.completion_tokens, Some(2));
        assert_eq!(assembly.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn lines_split_across_feeds() {
        let mut s = OllamaStream::new();
        assert!(s.feed(b"{\"response\":\"he").is_empty());
        let events = s.feed(b"llo\",\"done\":true}\n");
        assert_eq!(events.len(), 1);
        assert_eq!(s.finalize().reconstructed_text.as_deref(), Some("hello"));
    }

    #[test]
    fn chat_stream_reads_message_content() {
        let mut s = OllamaStream::new();
        s.feed(b"{\"message\":{\"role\":\"assistant\",\"content\":\"ok\"},\"done\":true}\n");
        assert_eq!(s.finalize().reconstructed_text.as_deref(), Some("ok"));
    }

    #[test]
    fn malformed_line_is_tagged_and_skipped() {
        let mut s = OllamaStream::new();
        let events = s.feed(b"not json\n{\"response\":\"x\",\"done\":true}\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "malformed");
        assert_eq!(s.finalize().reconstructed_text.as_deref(), Some("x"));
    }

    #[test]
    fn truncated_tail_is_flushed() {
        let mut s = OllamaStream::new();
        s.feed(b"{\"response\":\"A\",\"done\":false}\n{\"respo");
        let tail = s.take_tail().expect("tail bytes");
        assert_eq!(&tail[..], b"{\"respo");
    }

    #[test]
    fn non_stream_response_parses() {
        let body = serde_json::json!({
            "model": "llama3.2",
            "response": "The sky is blue because...",
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 26,
            "eval_count": 62
        });
        let assembly = parse_response(200, serde_json::to_vec(&body).unwrap().as_slice());
        assert_eq!(
            assembly.reconstructed_text.as_deref(),
            Some("The sky is blue because...")
        );
        assert_eq!(assembly.usage.prompt_tokens, Some(26));
        assert_eq!(assembly.usage.completion_tokens, Some(62));
    }
}
