// Secret redaction for stored headers and (optionally) bodies
//
// Requests are forwarded upstream verbatim - redaction applies only to the
// copies that land in the database. Values are replaced by "<redacted:N>"
// where N is the byte length of the original, so operators can still tell a
// real key apart from an empty header without ever persisting the secret.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Header names whose values are always redacted, compared case-insensitively
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "api-key",
    "anthropic-api-key",
    "openai-api-key",
    "proxy-authorization",
    "cookie",
];

/// Bearer-token shape caught in any header value regardless of header name
fn bearer_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Bearer\s+[A-Za-z0-9._\-]+").expect("bearer pattern"))
}

/// Marker shape produced by a previous redaction pass
fn marker_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<redacted:\d+>$").expect("marker pattern"))
}

fn marker(original_len: usize) -> String {
    format!("<redacted:{}>", original_len)
}

/// Redact a single header value given its name. Returns the value unchanged
/// when neither rule applies. Idempotent: an already-redacted marker is left
/// as-is so repeated passes cannot re-measure the marker itself.
pub fn redact_header_value(name: &str, value: &str) -> String {
    if marker_pattern().is_match(value) {
        return value.to_string();
    }
    let lower = name.to_ascii_lowercase();
    if SENSITIVE_HEADERS.contains(&lower.as_str()) || bearer_pattern().is_match(value) {
        return marker(value.len());
    }
    value.to_string()
}

/// Redact a whole header map for storage
pub fn redact_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| (name.clone(), redact_header_value(name, value)))
        .collect()
}

/// Redact bearer-shaped tokens inside a body. Disabled by default; the proxy
/// calls this only when body redaction is configured on.
pub fn redact_body(body: &str) -> String {
    bearer_pattern()
        .replace_all(body, |caps: &regex::Captures<'_>| marker(caps[0].len()))
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn sensitive_names_fully_redacted() {
        let h = headers(&[
            ("Authorization", "Bearer sk-abc123"),
            ("X-Api-Key", "sk-ant-xyz"),
            ("Cookie", "session=1"),
            ("content-type", "application/json"),
        ]);
        let r = redact_headers(&h);
        // N is the byte length of the replaced value
        assert_eq!(r["Authorization"], "<redacted:16>");
        assert_eq!(r["X-Api-Key"], "<redacted:10>");
        assert_eq!(r["Cookie"], "<redacted:9>");
        assert_eq!(r["content-type"], "application/json");
    }

    #[test]
    fn bearer_shape_redacted_under_any_name() {
        let h = headers(&[("x-forwarded-auth", "Bearer tok_en.value-1")]);
        let r = redact_headers(&h);
        assert_eq!(r["x-forwarded-auth"], "<redacted:21>");
    }

    #[test]
    fn redaction_is_idempotent() {
        let h = headers(&[
            ("Authorization", "Bearer sk-abc123"),
            ("x-api-key", "short"),
        ]);
        let once = redact_headers(&h);
        let twice = redact_headers(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn stored_values_never_match_patterns() {
        let h = headers(&[("Authorization", "Bearer sk-abc123")]);
        let r = redact_headers(&h);
        for value in r.values() {
            assert!(!bearer_pattern().is_match(value));
        }
    }

    #[test]
    fn body_redaction_replaces_tokens_in_place() {
        let body = r#"{"auth":"Bearer abc","note":"plain"}"#;
        let redacted = redact_body(body);
        assert_eq!(redacted, r#"{"auth":"<redacted:10>","note":"plain"}"#);
        assert_eq!(redact_body(&redacted), redacted);
    }
}
