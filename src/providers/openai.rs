// OpenAI chat/completions protocol
//
// Streaming responses are anonymous SSE `data:` frames ending with the
// `[DONE]` sentinel. Text arrives as `choices[0].delta.content`; tool calls
// arrive fragmented, keyed by index, with `function.arguments` split across
// frames and accumulated by string concatenation. A trailing frame may carry
// `usage` when the client asked for it via stream_options.

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
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    tools: Vec<Value>,
    #[serde(default)]
    stream: Option<bool>,
    /// Legacy /v1/completions prompt
    #[serde(default)]
    prompt: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Message {
    role: String,
    #[serde(default)]
    content: Option<Value>,
}

pub fn parse_request(body: &[u8]) -> RequestSummary {
    let request: ApiRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            tracing::debug!("OpenAI request body not parseable: {}", e);
            return RequestSummary::default();
        }
    };

    let mut messages = Vec::with_capacity(request.messages.len());
    let mut system_prompt = None;
    let mut image_metadata = Vec::new();
    let mut image_index = 0usize;

    for msg in &request.messages {
        let content = msg
            .content
            .as_ref()
            .map(|c| flatten_content(c, &mut image_metadata, &mut image_index))
            .unwrap_or_default();

        // "developer" replaced "system" in newer API revisions
        if system_prompt.is_none() && (msg.role == "system" || msg.role == "developer") {
            system_prompt = Some(content.clone());
        }

        messages.push(MessageEntry {
            role: msg.role.clone(),
            content,
        });
    }

    // Legacy completions endpoint: a bare prompt instead of messages
    if messages.is_empty() {
        if let Some(prompt) = request.prompt.as_ref().and_then(|p| p.as_str()) {
            messages.push(MessageEntry {
                role: "user".to_string(),
                content: prompt.to_string(),
            });
        }
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

/// Flatten string-or-parts content, siphoning image parts into metadata
fn flatten_content(
    content: &Value,
    images: &mut Vec<ImageMeta>,
    image_index: &mut usize,
) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => {
            let mut text_parts = Vec::new();
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                            text_parts.push(text);
                        }
                    }
                    Some("image_url") => {
                        let url = part
                            .get("image_url")
                            .and_then(|i| i.get("url"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        images.push(image_meta(*image_index, url));
                        *image_index += 1;
                    }
                    _ => {}
                }
            }
            text_parts.join("\n")
        }
        _ => String::new(),
    }
}

/// Data URLs yield a mime and decoded size; remote URLs are recorded by
/// reference only
fn image_meta(index: usize, url: &str) -> ImageMeta {
    if let Some(rest) = url.strip_prefix("data:") {
        let mime = rest.split(';').next().unwrap_or("image/*").to_string();
        let size_bytes = rest
            .split_once("base64,")
            .map(|(_, payload)| payload.len() * 3 / 4)
            .unwrap_or(0);
        ImageMeta {
            index,
            mime,
            size_bytes,
        }
    } else {
        ImageMeta {
            index,
            mime: "url".to_string(),
            size_bytes: 0,
        }
    }
}

// ============================================================================
// Streaming assembly
// ============================================================================

/// Tool call under accumulation, keyed by its delta index
#[derive(Debug, Default)]
struct ToolAcc {
    id: Option<String>,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct OpenAiStream {
    framer: SseFramer,
    model: Option<String>,
    text: String,
    tool_calls: BTreeMap<u64, ToolAcc>,
    finish_reason: Option<String>,
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
    error: Option<String>,
}

impl OpenAiStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        let frames = self.framer.push(bytes);
        let mut events = Vec::with_capacity(frames.len());

        for frame in frames {
            if frame.data.is_empty() {
                events.push(FrameEvent {
                    event_type: frame.event.unwrap_or_else(|| "comment".to_string()),
                    raw: frame.raw,
                    decoded: None,
                });
                continue;
            }

            if frame.data.trim() == "[DONE]" {
                events.push(FrameEvent {
                    event_type: "done".to_string(),
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

            self.apply(&data);

            events.push(FrameEvent {
                event_type: "chunk".to_string(),
                raw: frame.raw,
                decoded: Some(data),
            });
        }

        events
    }

    fn apply(&mut self, data: &Value) {
        if self.model.is_none() {
            self.model = data.get("model").and_then(|v| v.as_str()).map(String::from);
        }

        // Error chunks replace the choices array entirely
        if let Some(err) = data.get("error") {
            let message = err
                .get("message")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| err.to_string());
            self.error = Some(message);
        }

        if let Some(choice) = data.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first())
        {
            if let Some(delta) = choice.get("delta") {
                if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                    self.text.push_str(content);
                }
                if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                    for call in calls {
                        let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                        let acc = self.tool_calls.entry(index).or_default();
                        if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                            acc.id = Some(id.to_string());
                        }
                        if let Some(function) = call.get("function") {
                            if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                                acc.name.push_str(name);
                            }
                            if let Some(args) =
                                function.get("arguments").and_then(|v| v.as_str())
                            {
                                acc.arguments.push_str(args);
                            }
                        }
                    }
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                self.finish_reason = Some(reason.to_string());
            }
        }

        // Trailing usage frame (stream_options: {include_usage: true})
        if let Some(usage) = data.get("usage").filter(|u| !u.is_null()) {
            self.prompt_tokens = usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .or(self.prompt_tokens);
            self.completion_tokens = usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .or(self.completion_tokens);
            self.total_tokens = usage
                .get("total_tokens")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .or(self.total_tokens);
        }
    }

    pub fn take_tail(&mut self) -> Option<Bytes> {
        self.framer.take_tail()
    }

    pub fn content_len(&self) -> usize {
        self.text.len()
    }

    pub fn finalize(&mut self) -> Assembly {
        let tool_calls = self
            .tool_calls
            .values()
            .map(|acc| ToolCall {
                id: acc.id.clone(),
                name: acc.name.clone(),
                arguments: parse_arguments(&acc.arguments),
            })
            .collect::<Vec<_>>();

        Assembly {
            model: self.model.clone(),
            reconstructed_text: (!self.text.is_empty()).then(|| self.text.clone()),
            tool_calls,
            usage: Usage {
                prompt_tokens: self.prompt_tokens,
                completion_tokens: self.completion_tokens,
                total_tokens: self.total_tokens,
                ..Default::default()
            },
            finish_reason: self.finish_reason.clone(),
            error: self.error.clone(),
        }
    }
}

fn parse_arguments(buf: &str) -> Value {
    if buf.is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(buf).unwrap_or_else(|_| Value::String(buf.to_string()))
}

// ============================================================================
// Non-streaming responses
// ============================================================================

pub fn parse_response(status: u16, body: &[u8]) -> Assembly {
    if status >= 400 {
        return Assembly {
            error: Some(extract_error(body)),
            ..Default::default()
        };
    }

    let data: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("OpenAI response body not parseable: {}", e);
            return Assembly::default();
        }
    };

    let model = data.get("model").and_then(|v| v.as_str()).map(String::from);
    let choice = data.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first());

    let mut reconstructed_text = None;
    let mut tool_calls = Vec::new();
    let mut finish_reason = None;

    if let Some(choice) = choice {
        let message = choice.get("message");
        reconstructed_text = message
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(String::from)
            // Legacy completions: choices[0].text
            .or_else(|| choice.get("text").and_then(|v| v.as_str()).map(String::from));

        if let Some(calls) = message
            .and_then(|m| m.get("tool_calls"))
            .and_then(|t| t.as_array())
        {
            for call in calls {
                let Some(function) = call.get("function") else {
                    continue;
                };
                tool_calls.push(ToolCall {
                    id: call.get("id").and_then(|v| v.as_str()).map(String::from),
                    name: function
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: function
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .map(parse_arguments)
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                });
            }
        }

        finish_reason = choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from);
    }

    let usage = data.get("usage");
    Assembly {
        model,
        reconstructed_text,
        tool_calls,
        usage: Usage {
            prompt_tokens: usage
                .and_then(|u| u.get("prompt_tokens"))
                .and_then(|v| v.as_u64())
                .map(|v| v as u32),
            completion_tokens: usage
                .and_then(|u| u.get("completion_tokens"))
                .and_then(|v| v.as_u64())
                .map(|v| v as u32),
            total_tokens: usage
                .and_then(|u| u.get("total_tokens"))
                .and_then(|v| v.as_u64())
                .map(|v| v as u32),
            ..Default::default()
        },
        finish_reason,
        error: None,
    }
}

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

    #[test]
    fn request_summary_extracts_semantics() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "describe"},
                    {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,AAAABBBBCCCC"}}
                ]}
            ],
            "tools": [{"type": "function", "function": {"name": "lookup"}}]
        });
        let summary = parse_request(serde_json::to_vec(&body).unwrap().as_slice());
        assert_eq!(summary.model.as_deref(), Some("gpt-4o"));
        assert_eq!(summary.system_prompt.as_deref(), Some("be brief"));
        assert!(summary.stream_requested);
        assert_eq!(summary.messages.len(), 2);
        assert_eq!(summary.tools.len(), 1);
        assert_eq!(summary.image_metadata.len(), 1);
        assert_eq!(summary.image_metadata[0].mime, "image/jpeg");
        assert_eq!(summary.image_metadata[0].size_bytes, 9);
    }

    #[test]
    fn stream_appends_content_deltas() {
        let mut s = OpenAiStream::new();
        let stream = concat!(
            "data: {\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        let events = s.feed(stream.as_bytes());
        assert_eq!(events.len(), 4);
        assert_eq!(events[3].event_type, "done");

        let assembly = s.finalize();
        assert_eq!(assembly.reconstructed_text.as_deref(), Some("hello"));
        assert_eq!(assembly.model.as_deref(), Some("gpt-4o"));
        assert_eq!(assembly.finish_reason.as_deref(), Some("stop"));
        assert_eq!(assembly.usage.total_tokens, Some(5));
        assert!(!assembly.usage.heuristic);
    }

    #[test]
    fn stream_accumulates_tool_call_fragments() {
        let mut s = OpenAiStream::new();
        let stream = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"lookup\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"q\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"rust\\\"}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        s.feed(stream.as_bytes());
        let assembly = s.finalize();
        assert_eq!(assembly.tool_calls.len(), 1);
        assert_eq!(assembly.tool_calls[0].name, "lookup");
        assert_eq!(assembly.tool_calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(assembly.tool_calls[0].arguments, serde_json::json!({"q": "rust"}));
        assert_eq!(assembly.finish_reason.as_deref(), Some("tool_calls"));
        // Tool-only responses have no text to reconstruct
        assert!(assembly.reconstructed_text.is_none());
    }

    #[test]
    fn heuristic_usage_without_trailing_frame() {
        let mut s = OpenAiStream::new();
        let stream = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"twelve bytes\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        s.feed(stream.as_bytes());
        let mut assembly = s.finalize();
        assembly.settle_tokens();
        assert_eq!(assembly.usage.total_tokens, Some(3));
        assert!(assembly.usage.heuristic);
    }

    #[test]
    fn non_stream_response_parses() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10}
        });
        let assembly = parse_response(200, serde_json::to_vec(&body).unwrap().as_slice());
        assert_eq!(assembly.reconstructed_text.as_deref(), Some("hello"));
        assert_eq!(assembly.usage.total_tokens, Some(10));
        assert_eq!(assembly.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn error_status_extracts_message() {
        let body = br#"{"error":{"message":"Rate limit reached","type":"rate_limit_error"}}"#;
        let assembly = parse_response(429, body);
        assert_eq!(assembly.error.as_deref(), Some("Rate limit reached"));
    }
}
