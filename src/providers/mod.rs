// Provider registry and the uniform parser surface
//
// Three wire protocols (OpenAI chat/completions, Anthropic messages, Ollama
// NDJSON) are decoded into one shape. Dispatch is a tagged enum over the
// concrete parsers - the set of providers is closed, so there is no trait
// object in the path.
//
// Every parser offers the same capability set:
//   - parse_request: semantic summary of the request body
//   - StreamAssembler::feed: decode newly complete frames from transport
//     bytes, buffering any partial tail until the next call
//   - StreamAssembler::finalize: the assembled response
//   - parse_non_stream_response: same assembled shape for buffered bodies

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod sse;

use bytes::Bytes;

use crate::model::{estimate_tokens, Provider, RequestSummary, ToolCall, Usage};

/// Classify a request path into a provider. Path-first, evaluated in order;
/// the session prefix has already been stripped by the time this runs.
pub fn classify(path: &str) -> Provider {
    if path.starts_with("/v1/messages") {
        Provider::Anthropic
    } else if path.starts_with("/v1/") {
        Provider::OpenAi
    } else if path.starts_with("/api/") {
        Provider::Ollama
    } else {
        Provider::Passthrough
    }
}

/// One decoded frame emitted by an assembler. Becomes a StreamChunk row.
#[derive(Debug, Clone)]
pub struct FrameEvent {
    /// Provider-specific tag: an Anthropic event name, "chunk"/"done" for
    /// OpenAI and Ollama, "raw" for passthrough, "malformed" for frames
    /// whose payload failed to decode, "partial" for a truncated tail.
    pub event_type: String,
    pub raw: Bytes,
    pub decoded: Option<serde_json::Value>,
}

impl FrameEvent {
    pub fn malformed(raw: Bytes) -> Self {
        Self {
            event_type: "malformed".to_string(),
            raw,
            decoded: None,
        }
    }
}

/// The assembled semantic view of a response
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    /// Model as reported by the response, when the wire format carries it
    pub model: Option<String>,
    pub reconstructed_text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish_reason: Option<String>,
    pub error: Option<String>,
}

impl Assembly {
    /// Fill total_tokens from provider counts, or fall back to the bytes/4
    /// estimate over the reconstructed text and flag it heuristic.
    pub(crate) fn settle_tokens(&mut self) {
        if self.usage.total_tokens.is_some() {
            return;
        }
        match (self.usage.prompt_tokens, self.usage.completion_tokens) {
            (Some(p), Some(c)) => self.usage.total_tokens = Some(p.saturating_add(c)),
            (None, Some(c)) => self.usage.total_tokens = Some(c),
            _ => {
                if let Some(text) = self.reconstructed_text.as_deref() {
                    if !text.is_empty() {
                        self.usage.total_tokens = Some(estimate_tokens(text));
                        self.usage.heuristic = true;
                    }
                }
            }
        }
    }
}

/// Parse a request body into its semantic summary. Never fails: a body the
/// provider parser cannot make sense of yields an empty summary.
pub fn parse_request(provider: Provider, body: &[u8]) -> RequestSummary {
    match provider {
        Provider::OpenAi => openai::parse_request(body),
        Provider::Anthropic => anthropic::parse_request(body),
        Provider::Ollama => ollama::parse_request(body),
        Provider::Passthrough => RequestSummary::default(),
    }
}

/// Assemble a buffered (non-streaming) response body
pub fn parse_non_stream_response(provider: Provider, status: u16, body: &[u8]) -> Assembly {
    let mut assembly = match provider {
        Provider::OpenAi => openai::parse_response(status, body),
        Provider::Anthropic => anthropic::parse_response(status, body),
        Provider::Ollama => ollama::parse_response(status, body),
        Provider::Passthrough => Assembly::default(),
    };
    assembly.settle_tokens();
    assembly
}

/// Per-interaction streaming accumulator. Owned by exactly one capture task;
/// state is never shared.
pub enum StreamAssembler {
    OpenAi(openai::OpenAiStream),
    Anthropic(anthropic::AnthropicStream),
    Ollama(ollama::OllamaStream),
    Raw(RawStream),
}

impl StreamAssembler {
    pub fn new(provider: Provider) -> Self {
        match provider {
            Provider::OpenAi => StreamAssembler::OpenAi(openai::OpenAiStream::new()),
            Provider::Anthropic => StreamAssembler::Anthropic(anthropic::AnthropicStream::new()),
            Provider::Ollama => StreamAssembler::Ollama(ollama::OllamaStream::new()),
            Provider::Passthrough => StreamAssembler::Raw(RawStream::default()),
        }
    }

    /// Feed transport bytes; returns every frame completed by this call
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        match self {
            StreamAssembler::OpenAi(s) => s.feed(bytes),
            StreamAssembler::Anthropic(s) => s.feed(bytes),
            StreamAssembler::Ollama(s) => s.feed(bytes),
            StreamAssembler::Raw(s) => s.feed(bytes),
        }
    }

    /// Flush a truncated trailing frame, if any bytes are still buffered.
    /// Called once at stream end, before finalize, so that chunk bytes sum
    /// to the full streamed body even on abnormal termination.
    pub fn flush_tail(&mut self) -> Option<FrameEvent> {
        let tail = match self {
            StreamAssembler::OpenAi(s) => s.take_tail(),
            StreamAssembler::Anthropic(s) => s.take_tail(),
            StreamAssembler::Ollama(s) => s.take_tail(),
            StreamAssembler::Raw(_) => None,
        }?;
        Some(FrameEvent {
            event_type: "partial".to_string(),
            raw: tail,
            decoded: None,
        })
    }

    /// Bytes of assembled content text so far. The handler uses the first
    /// transition above zero as time-to-first-token.
    pub fn content_len(&self) -> usize {
        match self {
            StreamAssembler::OpenAi(s) => s.content_len(),
            StreamAssembler::Anthropic(s) => s.content_len(),
            StreamAssembler::Ollama(s) => s.content_len(),
            StreamAssembler::Raw(_) => 0,
        }
    }

    pub fn finalize(&mut self) -> Assembly {
        let mut assembly = match self {
            StreamAssembler::OpenAi(s) => s.finalize(),
            StreamAssembler::Anthropic(s) => s.finalize(),
            StreamAssembler::Ollama(s) => s.finalize(),
            StreamAssembler::Raw(_) => Assembly::default(),
        };
        assembly.settle_tokens();
        assembly
    }
}

/// Passthrough accumulator: no framing, no semantics. Each transport chunk
/// is recorded as a single opaque frame so the capture trail stays complete.
#[derive(Debug, Default)]
pub struct RawStream;

impl RawStream {
    fn feed(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        if bytes.is_empty() {
            return Vec::new();
        }
        vec![FrameEvent {
            event_type: "raw".to_string(),
            raw: Bytes::copy_from_slice(bytes),
            decoded: None,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_rules_in_order() {
        assert_eq!(classify("/v1/messages"), Provider::Anthropic);
        assert_eq!(classify("/v1/messages/count_tokens"), Provider::Anthropic);
        assert_eq!(classify("/v1/chat/completions"), Provider::OpenAi);
        assert_eq!(classify("/v1/completions"), Provider::OpenAi);
        assert_eq!(classify("/api/generate"), Provider::Ollama);
        assert_eq!(classify("/api/chat"), Provider::Ollama);
        assert_eq!(classify("/foo"), Provider::Passthrough);
        assert_eq!(classify("/"), Provider::Passthrough);
    }

    #[test]
    fn heuristic_tokens_only_without_provider_counts() {
        let mut with_counts = Assembly {
            usage: Usage {
                prompt_tokens: Some(10),
                completion_tokens: Some(5),
                ..Default::default()
            },
            reconstructed_text: Some("hello".to_string()),
            ..Default::default()
        };
        with_counts.settle_tokens();
        assert_eq!(with_counts.usage.total_tokens, Some(15));
        assert!(!with_counts.usage.heuristic);

        let mut without = Assembly {
            reconstructed_text: Some("hello world, longer".to_string()),
            ..Default::default()
        };
        without.settle_tokens();
        assert_eq!(without.usage.total_tokens, Some(5));
        assert!(without.usage.heuristic);
    }

    #[test]
    fn passthrough_stream_records_raw_frames() {
        let mut asm = StreamAssembler::new(Provider::Passthrough);
        let events = asm.feed(b"opaque bytes");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "raw");
        assert!(asm.flush_tail().is_none());
        let assembly = asm.finalize();
        assert!(assembly.reconstructed_text.is_none());
        assert!(assembly.tool_calls.is_empty());
    }
}
