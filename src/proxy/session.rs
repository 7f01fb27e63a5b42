//! Session tagging via the /_session/{id} path convention
//!
//! Clients that cannot set custom headers can still tag their traffic by
//! prefixing the upstream path: `/_session/agent-a/v1/messages` forwards to
//! `/v1/messages` with session_id "agent-a". Extraction runs before provider
//! classification, so the prefix never changes how a request is classified.

use regex::Regex;
use std::sync::OnceLock;

fn session_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/_session/([A-Za-z0-9._\-]{1,128})(/.*)?$").expect("session pattern")
    })
}

/// Split a request path into (session_id, forward path). Paths without the
/// prefix - including malformed session ids - pass through untouched.
pub(crate) fn extract(path: &str) -> (Option<String>, String) {
    let Some(caps) = session_pattern().captures(path) else {
        return (None, path.to_string());
    };

    let session_id = caps[1].to_string();
    let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let forward = if rest.is_empty() { "/" } else { rest };

    (Some(session_id), forward.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_consumed() {
        let (session, path) = extract("/_session/agent-a/v1/messages");
        assert_eq!(session.as_deref(), Some("agent-a"));
        assert_eq!(path, "/v1/messages");
    }

    #[test]
    fn no_prefix_passes_through() {
        let (session, path) = extract("/v1/chat/completions");
        assert!(session.is_none());
        assert_eq!(path, "/v1/chat/completions");
    }

    #[test]
    fn bare_session_maps_to_root() {
        let (session, path) = extract("/_session/agent-b");
        assert_eq!(session.as_deref(), Some("agent-b"));
        assert_eq!(path, "/");
    }

    #[test]
    fn ids_with_allowed_punctuation() {
        let (session, path) = extract("/_session/run_2026-08.1/api/generate");
        assert_eq!(session.as_deref(), Some("run_2026-08.1"));
        assert_eq!(path, "/api/generate");
    }

    #[test]
    fn invalid_ids_are_not_consumed() {
        // Embedded space fails the character class; path forwarded verbatim
        let (session, path) = extract("/_session/bad id/v1/messages");
        assert!(session.is_none());
        assert_eq!(path, "/_session/bad id/v1/messages");

        // Over-long ids rejected too
        let long = format!("/_session/{}/v1/messages", "x".repeat(129));
        let (session, path) = extract(&long);
        assert!(session.is_none());
        assert_eq!(path, long);
    }

    #[test]
    fn classification_is_unchanged_by_prefix() {
        use crate::model::Provider;
        use crate::providers::classify;
        let (_, path) = extract("/_session/foo/v1/messages");
        assert_eq!(classify(&path), Provider::Anthropic);
    }
}
