//! Shared state for the proxy server

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::config::Config;
use crate::store::{query::StoreQuery, InteractionStore};

/// Process-wide state handed to every handler. Initialized once at startup,
/// torn down on shutdown; nothing here is mutated ad hoc.
#[derive(Clone)]
pub(crate) struct ProxyState {
    /// HTTP client for forwarding requests (shared connection pool)
    pub client: reqwest::Client,
    pub config: Arc<Config>,
    /// Write handle to the interaction store
    pub store: Arc<InteractionStore>,
    /// Read pool over the same database
    pub query: Arc<StoreQuery>,
    /// Live capture tasks, drained on shutdown
    pub inflight: Arc<AtomicUsize>,
}
