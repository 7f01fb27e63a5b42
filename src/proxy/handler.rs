//! The proxy handler: receive, classify, forward, intercept, persist
//!
//! One invocation drives a request end to end:
//!
//! ```text
//! RECEIVING_REQUEST -> CLASSIFIED -> FORWARDING
//!        -> [STREAMING | AWAITING_BODY] -> FINALIZING -> PERSISTED
//! ```
//!
//! The pending row is inserted as soon as the request is parsed; streaming
//! responses hand finalization to a capture task (see tee module), buffered
//! responses finalize inline. Bytes relayed to the client are never modified.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, Response, StatusCode},
};
use chrono::Utc;
use tokio::sync::mpsc;

use crate::model::{
    generate_id, InteractionOutcome, PendingInteraction, RequestCapture, ResponseCapture, Usage,
};
use crate::providers::{self, StreamAssembler};
use crate::redact;

use super::error::ProxyError;
use super::session;
use super::state::ProxyState;
use super::tee::{spawn_capture, CaptureConfig, InflightGuard, TeeBody};

/// Headers that must not be forwarded in either direction (hop-by-hop)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Main proxy handler - intercepts and forwards all non-admin requests
pub(crate) async fn proxy_handler(
    State(state): State<ProxyState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let started = Instant::now();
    let started_at = Utc::now();

    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    // Session prefix first, then classification over the rewritten path
    let (session_id, forward_path) = session::extract(uri.path());
    let provider = providers::classify(&forward_path);

    tracing::debug!(
        method = %method,
        path = %forward_path,
        provider = %provider,
        session = session_id.as_deref().unwrap_or("-"),
        "Proxying request"
    );

    // A client that cannot deliver its own body gets a 400 and no row
    let body_bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| ProxyError::BodyRead(e.to_string()))?;

    let summary = providers::parse_request(provider, &body_bytes);
    let interaction_id = generate_id();

    let pending = PendingInteraction {
        id: interaction_id.clone(),
        session_id,
        started_at,
        provider,
        method: method.to_string(),
        path: forward_path.clone(),
        model: summary.model.clone(),
        request: RequestCapture {
            headers: storage_headers(&headers, state.config.redact),
            body: storage_body(&body_bytes, &state.config),
            client_addr: Some(client_addr.to_string()),
            summary: summary.clone(),
        },
    };
    state.store.insert_pending(pending);

    // Build the forward URL from the per-provider base
    let base = state.config.upstream_url(provider).trim_end_matches('/');
    let forward_url = match uri.query() {
        Some(query) => format!("{}{}?{}", base, forward_path, query),
        None => format!("{}{}", base, forward_path),
    };

    let mut forward_req = state
        .client
        .request(method.clone(), &forward_url)
        .body(body_bytes.to_vec());

    // Forward non-hop-by-hop headers verbatim. Content-length is recomputed
    // by the client from the actual body.
    for (name, value) in headers.iter() {
        let name_str = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&name_str.as_str()) || name_str == "content-length" {
            continue;
        }
        forward_req = forward_req.header(name, value);
    }

    let response = match forward_req.send().await {
        Ok(response) => response,
        Err(e) => {
            let (status, error, message) = if e.is_timeout() {
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    "upstream_timeout",
                    "upstream timeout",
                )
            } else {
                (
                    StatusCode::BAD_GATEWAY,
                    "upstream_connect",
                    "upstream connection error",
                )
            };
            tracing::error!(error = %e, provider = %provider, "Upstream request failed");
            complete_without_response(
                &state,
                &interaction_id,
                status.as_u16(),
                error,
                summary.model.clone(),
                started,
            );
            return Response::builder()
                .status(status)
                .body(Body::from(message))
                .map_err(|e| ProxyError::ResponseBuild(e.to_string()));
        }
    };

    let status = response.status();
    let ttfb_ms = started.elapsed().as_millis() as u64;
    // reqwest and axum share the http 1.x header types, so the same storage
    // conversion applies to both directions
    let response_headers = response.headers().clone();
    let stored_response_headers = storage_headers(&response_headers, state.config.redact);

    tracing::info!(
        status = status.as_u16(),
        ttfb_ms,
        provider = %provider,
        "Upstream responded"
    );

    if is_streaming(&response_headers) {
        // STREAMING: hand the body to a tee; a capture task owns assembly
        // and persistence so the relay path never waits on either
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_capture(
            state.store.clone(),
            CaptureConfig {
                interaction_id,
                assembler: StreamAssembler::new(provider),
                status: status.as_u16(),
                response_headers: stored_response_headers,
                request_model: summary.model,
                started,
                ttfb_ms,
            },
            rx,
            InflightGuard::new(state.inflight.clone()),
        );

        let tee = TeeBody::new(response.bytes_stream(), tx);
        let mut builder = Response::builder().status(status);
        for (name, value) in response_headers.iter() {
            if HOP_BY_HOP_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from_stream(tee))
            .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
    } else {
        // AWAITING_BODY: buffer the whole response, assemble, persist,
        // and relay the bytes unchanged
        let response_body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "Upstream body read failed");
                let timed_out = e.is_timeout();
                complete_without_response(
                    &state,
                    &interaction_id,
                    status.as_u16(),
                    if timed_out {
                        "upstream_timeout"
                    } else {
                        "upstream_protocol"
                    },
                    summary.model.clone(),
                    started,
                );
                let message = format!("upstream body read failed: {}", e);
                return Err(if timed_out {
                    ProxyError::UpstreamTimeout(message)
                } else {
                    ProxyError::UpstreamConnect(message)
                });
            }
        };

        let assembly =
            providers::parse_non_stream_response(provider, status.as_u16(), &response_body);

        let outcome = InteractionOutcome {
            id: interaction_id,
            completed_at: Utc::now(),
            status_code: Some(status.as_u16()),
            model: assembly.model.or(summary.model),
            response: ResponseCapture {
                headers: stored_response_headers,
                body: String::from_utf8_lossy(&response_body).into_owned(),
                reconstructed_text: assembly.reconstructed_text,
                tool_calls: assembly.tool_calls,
                finish_reason: assembly.finish_reason,
                error: assembly.error.clone(),
            },
            usage: assembly.usage,
            cost_estimate: None,
            ttfb_ms: Some(ttfb_ms),
            ttft_ms: None,
            total_latency_ms: Some(started.elapsed().as_millis() as u64),
            chunk_count: 0,
            error: assembly.error,
        };
        state.store.complete(outcome);

        let mut builder = Response::builder().status(status);
        for (name, value) in response_headers.iter() {
            if HOP_BY_HOP_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder
            .body(Body::from(response_body))
            .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
    }
}

/// Streaming is signalled by content type: SSE for OpenAI/Anthropic,
/// NDJSON for Ollama
fn is_streaming(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream") || ct.contains("application/x-ndjson"))
        .unwrap_or(false)
}

/// Finalize an interaction that never produced a relayable response
fn complete_without_response(
    state: &ProxyState,
    interaction_id: &str,
    status: u16,
    error: &str,
    model: Option<String>,
    started: Instant,
) {
    state.store.complete(InteractionOutcome {
        id: interaction_id.to_string(),
        completed_at: Utc::now(),
        status_code: Some(status),
        model,
        response: ResponseCapture {
            error: Some(error.to_string()),
            ..Default::default()
        },
        usage: Usage::default(),
        cost_estimate: None,
        ttfb_ms: None,
        ttft_ms: None,
        total_latency_ms: Some(started.elapsed().as_millis() as u64),
        chunk_count: 0,
        error: Some(error.to_string()),
    });
}

/// Flatten an axum header map for storage, redacting when configured
fn storage_headers(headers: &HeaderMap, redact_enabled: bool) -> BTreeMap<String, String> {
    let map: BTreeMap<String, String> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    if redact_enabled {
        redact::redact_headers(&map)
    } else {
        map
    }
}

fn storage_body(body: &[u8], config: &crate::config::Config) -> String {
    let text = String::from_utf8_lossy(body).into_owned();
    if config.redact && config.redact_body {
        redact::redact_body(&text)
    } else {
        text
    }
}
