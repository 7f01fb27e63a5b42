// Core record types for captured traffic
//
// An Interaction is one client-observed request/response cycle; a StreamChunk
// is one framed unit (SSE event or NDJSON line) received while that cycle was
// streaming. Rich request/response captures are serialized to JSON columns,
// so these structs derive Serialize/Deserialize and tolerate absent fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upstream provider identity, decided by path-first classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Ollama,
    Passthrough,
}

impl Provider {
    /// Stable lowercase name, used in DB columns and API responses
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Ollama => "ollama",
            Provider::Passthrough => "passthrough",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Provider::OpenAi),
            "anthropic" => Some(Provider::Anthropic),
            "ollama" => Some(Provider::Ollama),
            "passthrough" => Some(Provider::Passthrough),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One role-tagged conversation entry, flattened to text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntry {
    pub role: String,
    pub content: String,
}

/// Metadata about an inline image in the request. The base64 payload itself
/// is never stored - only its position, type, and decoded size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMeta {
    pub index: usize,
    pub mime: String,
    pub size_bytes: usize,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    /// Parsed arguments; falls back to a JSON string when the accumulated
    /// argument bytes are not valid JSON
    pub arguments: serde_json::Value,
}

/// Token accounting for one interaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    /// True when total_tokens came from the bytes/4 estimate rather than
    /// a provider-reported count
    #[serde(default)]
    pub heuristic: bool,
}

/// Semantic summary of a request body, produced by the provider parsers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestSummary {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<MessageEntry>,
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
    #[serde(default)]
    pub image_metadata: Vec<ImageMeta>,
    #[serde(default)]
    pub stream_requested: bool,
}

/// Everything captured about the request, stored as the request_json column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCapture {
    /// Redacted header map (see redact module)
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes as (lossy) UTF-8; provider bodies are JSON text
    pub body: String,
    pub client_addr: Option<String>,
    #[serde(flatten)]
    pub summary: RequestSummary,
}

/// Everything captured about the response, stored as the response_json column
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseCapture {
    pub headers: BTreeMap<String, String>,
    /// For buffered responses the body verbatim; for streaming responses the
    /// concatenation of all wire bytes in receive order
    pub body: String,
    pub reconstructed_text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
    pub error: Option<String>,
}

/// Row inserted at request receipt, before the upstream exchange resolves.
/// Matches the store's write path: the parent row exists before any chunk.
#[derive(Debug, Clone)]
pub struct PendingInteraction {
    pub id: String,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub provider: Provider,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub request: RequestCapture,
}

/// Final state written exactly once when the exchange terminates
/// (success, upstream error, or client disconnect)
#[derive(Debug, Clone)]
pub struct InteractionOutcome {
    pub id: String,
    pub completed_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub model: Option<String>,
    pub response: ResponseCapture,
    pub usage: Usage,
    pub cost_estimate: Option<f64>,
    pub ttfb_ms: Option<u64>,
    pub ttft_ms: Option<u64>,
    pub total_latency_ms: Option<u64>,
    pub chunk_count: u32,
    pub error: Option<String>,
}

/// One framed unit received during a streaming response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub interaction_id: String,
    pub seq: u32,
    pub received_at: DateTime<Utc>,
    pub event_type: String,
    #[serde(with = "raw_bytes")]
    pub raw: Vec<u8>,
    pub decoded: Option<serde_json::Value>,
}

/// A fully materialized interaction as read back from the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub provider: Provider,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub status_code: Option<u16>,
    pub request: Option<RequestCapture>,
    pub response: Option<ResponseCapture>,
    pub usage: Usage,
    pub cost_estimate: Option<f64>,
    pub ttfb_ms: Option<u64>,
    pub ttft_ms: Option<u64>,
    pub total_latency_ms: Option<u64>,
    pub chunk_count: u32,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<StreamChunk>,
}

/// Derived session aggregate - never a stored row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub interactions: u64,
    pub models: Vec<String>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Generate a fresh interaction id.
///
/// Rows are durable across restarts, so ids must be unique beyond process
/// lifetime - a v4 UUID rather than a timestamp+counter scheme.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Estimate a token count from reconstructed text when the provider reports
/// no usage: ceil(bytes / 4), clamped. Marked heuristic by the caller.
pub fn estimate_tokens(text: &str) -> u32 {
    let bytes = text.len();
    (bytes.div_ceil(4)).min(u32::MAX as usize) as u32
}

/// Serialize chunk bytes as a lossy UTF-8 string in JSON exports. Wire frames
/// from all three providers are text; invalid sequences are replaced rather
/// than round-tripped.
mod raw_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(de)?.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_roundtrip() {
        for p in [
            Provider::OpenAi,
            Provider::Anthropic,
            Provider::Ollama,
            Provider::Passthrough,
        ] {
            assert_eq!(Provider::parse(p.as_str()), Some(p));
        }
        assert_eq!(Provider::parse("gemini"), None);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("hello world!"), 3);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
