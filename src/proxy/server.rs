//! Proxy server setup and initialization

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{any, get},
    Router,
};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::store::{query::StoreQuery, InteractionStore};

use super::api;
use super::handler::proxy_handler;
use super::state::ProxyState;

/// Start the proxy server and serve until the shutdown signal fires, then
/// drain in-flight captures within the configured grace period.
pub async fn start_proxy(
    config: Arc<Config>,
    store: Arc<InteractionStore>,
    query: Arc<StoreQuery>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let bind_addr = config.bind_addr()?;

    // Upstream HTTP client. No total timeout: streams are allowed to run
    // long, bounded instead by the idle-between-bytes read timeout.
    // HTTP/1.1 only to avoid HTTP/2 connection resets with some providers.
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .read_timeout(Duration::from_secs(120))
        .pool_max_idle_per_host(10)
        .http1_only()
        .build()
        .context("Failed to create HTTP client")?;

    let inflight = Arc::new(AtomicUsize::new(0));
    let state = ProxyState {
        client,
        config: config.clone(),
        store,
        query,
        inflight: inflight.clone(),
    };

    // Admin routes first; everything else falls through to the proxy.
    // The /*path matcher does not cover the bare root, hence the extra route.
    let app = Router::new()
        .route("/_interceptor/health", get(api::health))
        .route("/_interceptor/stats", get(api::stats))
        .route("/_interceptor/sessions", get(api::sessions))
        .route(
            "/_interceptor/interactions",
            get(api::list_interactions).delete(api::delete_interactions),
        )
        .route(
            "/_interceptor/interactions/:id",
            get(api::get_interaction),
        )
        .route("/", any(proxy_handler))
        .route("/*path", any(proxy_handler))
        .with_state(state);

    tracing::info!("Starting proxy on {}", bind_addr);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Proxy listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_rx.await.ok();
    })
    .await
    .context("Server error")?;

    drain_inflight(&inflight, Duration::from_secs(config.shutdown_grace_secs)).await;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}

/// Wait for live capture tasks to reach PERSISTED, up to the grace period
async fn drain_inflight(inflight: &AtomicUsize, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let remaining = inflight.load(Ordering::SeqCst);
        if remaining == 0 {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(remaining, "Shutdown grace period expired with captures in flight");
            return;
        }
        tracing::debug!(remaining, "Waiting for in-flight captures");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
