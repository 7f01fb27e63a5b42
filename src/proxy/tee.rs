//! Streaming tee: relay upstream bytes downstream while capturing them
//!
//! `TeeBody` wraps the upstream byte stream and is handed to axum as the
//! response body. Each polled chunk is yielded downstream unchanged and a
//! copy is pushed over a channel to the interaction's capture task, so
//! neither parsing nor store I/O ever sits between the upstream read and the
//! downstream write.
//!
//! The capture task owns the stream assembler: it turns transport bytes into
//! framed chunks, appends them to the store in receive order, and completes
//! the interaction when the stream terminates - whether by EOF, upstream
//! error, or client disconnect (detected via `Drop` on the tee).

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;

use crate::model::{InteractionOutcome, ResponseCapture, StreamChunk};
use crate::providers::StreamAssembler;
use crate::store::InteractionStore;

/// Messages from the tee to the capture task
#[derive(Debug)]
pub(crate) enum CaptureMsg {
    Chunk(Bytes),
    Eof,
    /// Upstream failed mid-stream; payload is the recorded error string
    Failed(String),
    /// The tee was dropped before the stream finished - the client went away
    Disconnected,
}

/// Counts live capture work so shutdown can drain it
#[derive(Debug)]
pub(crate) struct InflightGuard(Arc<AtomicUsize>);

impl InflightGuard {
    pub(crate) fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pass-through stream that feeds the capture channel
pub(crate) struct TeeBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    tx: mpsc::UnboundedSender<CaptureMsg>,
    finished: bool,
}

impl TeeBody {
    pub(crate) fn new(
        upstream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        tx: mpsc::UnboundedSender<CaptureMsg>,
    ) -> Self {
        Self {
            inner: Box::pin(upstream),
            tx,
            finished: false,
        }
    }
}

impl Stream for TeeBody {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let _ = self.tx.send(CaptureMsg::Chunk(chunk.clone()));
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                let recorded = if e.is_timeout() {
                    "upstream_timeout".to_string()
                } else {
                    format!("upstream_protocol: {}", e)
                };
                let _ = self.tx.send(CaptureMsg::Failed(recorded));
                // Propagating the error makes hyper abort the downstream
                // connection, which is the only honest signal mid-stream
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                let _ = self.tx.send(CaptureMsg::Eof);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.tx.send(CaptureMsg::Disconnected);
        }
    }
}

/// Everything the capture task needs to finalize its interaction
pub(crate) struct CaptureConfig {
    pub interaction_id: String,
    pub assembler: StreamAssembler,
    pub status: u16,
    /// Redacted upstream response headers
    pub response_headers: BTreeMap<String, String>,
    /// Model from the request summary, used when the stream never names one
    pub request_model: Option<String>,
    pub started: Instant,
    pub ttfb_ms: u64,
}

/// Spawn the per-interaction capture task. It drains the channel until a
/// terminal message arrives, then finalizes and completes the interaction.
pub(crate) fn spawn_capture(
    store: Arc<InteractionStore>,
    mut cfg: CaptureConfig,
    mut rx: mpsc::UnboundedReceiver<CaptureMsg>,
    guard: InflightGuard,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let _guard = guard;

        let mut body_raw: Vec<u8> = Vec::new();
        let mut seq: u32 = 0;
        let mut ttft_ms: Option<u64> = None;
        let mut terminal: Option<String> = None;

        loop {
            let Some(msg) = rx.recv().await else {
                // Sender vanished without a terminal message; treat it as a
                // disconnect so the row is still finalized
                terminal = Some("client_disconnect".to_string());
                break;
            };
            match msg {
                CaptureMsg::Chunk(bytes) => {
                    body_raw.extend_from_slice(&bytes);
                    for event in cfg.assembler.feed(&bytes) {
                        record_chunk(&store, &cfg.interaction_id, &mut seq, event);
                    }
                    if ttft_ms.is_none() && cfg.assembler.content_len() > 0 {
                        ttft_ms = Some(cfg.started.elapsed().as_millis() as u64);
                    }
                }
                CaptureMsg::Eof => break,
                CaptureMsg::Failed(error) => {
                    terminal = Some(error);
                    break;
                }
                CaptureMsg::Disconnected => {
                    terminal = Some("client_disconnect".to_string());
                    break;
                }
            }
        }

        // Account for a truncated trailing frame before finalizing
        if let Some(event) = cfg.assembler.flush_tail() {
            record_chunk(&store, &cfg.interaction_id, &mut seq, event);
        }

        let assembly = cfg.assembler.finalize();
        let error = terminal.or_else(|| assembly.error.clone());

        let outcome = InteractionOutcome {
            id: cfg.interaction_id.clone(),
            completed_at: Utc::now(),
            status_code: Some(cfg.status),
            model: assembly.model.or(cfg.request_model),
            response: ResponseCapture {
                headers: cfg.response_headers,
                body: String::from_utf8_lossy(&body_raw).into_owned(),
                reconstructed_text: assembly.reconstructed_text,
                tool_calls: assembly.tool_calls,
                finish_reason: assembly.finish_reason,
                error: assembly.error,
            },
            usage: assembly.usage,
            cost_estimate: None,
            ttfb_ms: Some(cfg.ttfb_ms),
            ttft_ms,
            total_latency_ms: Some(cfg.started.elapsed().as_millis() as u64),
            chunk_count: seq,
            error,
        };

        store.complete(outcome);
    })
}

fn record_chunk(
    store: &InteractionStore,
    interaction_id: &str,
    seq: &mut u32,
    event: crate::providers::FrameEvent,
) {
    let chunk = StreamChunk {
        interaction_id: interaction_id.to_string(),
        seq: *seq,
        received_at: Utc::now(),
        event_type: event.event_type,
        raw: event.raw.to_vec(),
        decoded: event.decoded,
    };
    *seq += 1;
    store.append_chunk(chunk);
}
