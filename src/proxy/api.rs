// Admin HTTP API - read/delete access over the interaction store
//
// Reserved under the /_interceptor/ prefix, registered ahead of the proxy
// catch-all so these paths never reach provider classification. All
// endpoints return JSON and are designed for local consumption only.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::{Interaction, SessionSummary};
use crate::store::query::{InteractionFilter, StoreStats};

use super::state::ProxyState;

/// Errors surfaced by API endpoints
#[derive(Debug)]
pub(crate) enum ApiError {
    NotFound,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Internal(msg) => {
                tracing::error!("API error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// GET /_interceptor/health
pub(crate) async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Store aggregates plus the writer's own health counters
#[derive(Debug, Serialize)]
pub(crate) struct StatsResponse {
    #[serde(flatten)]
    pub store: StoreStats,
    pub writer: crate::store::MetricsSnapshot,
}

/// GET /_interceptor/stats
pub(crate) async fn stats(
    State(state): State<ProxyState>,
) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        store: state.query.stats()?,
        writer: state.store.metrics(),
    }))
}

/// GET /_interceptor/sessions
pub(crate) async fn sessions(
    State(state): State<ProxyState>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(state.query.list_sessions()?))
}

/// Query parameters for the interaction listing
#[derive(Debug, Deserialize)]
pub(crate) struct ListParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ListResponse {
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub interactions: Vec<Interaction>,
}

/// GET /_interceptor/interactions - paginated, filters in query
pub(crate) async fn list_interactions(
    State(state): State<ProxyState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(1000);
    let offset = params.offset.unwrap_or(0);
    let filter = InteractionFilter {
        provider: params.provider,
        model: params.model,
        session_id: params.session_id,
    };

    let total = state.query.count_interactions(&filter)?;
    let interactions = state.query.list_interactions(limit, offset, &filter)?;

    Ok(Json(ListResponse {
        total,
        limit,
        offset,
        interactions,
    }))
}

/// GET /_interceptor/interactions/{id} - row plus chunks, or 404
pub(crate) async fn get_interaction(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Result<Json<Interaction>, ApiError> {
    match state.query.get_interaction(&id)? {
        Some(interaction) => Ok(Json(interaction)),
        None => Err(ApiError::NotFound),
    }
}

/// DELETE /_interceptor/interactions - clears the store, 204
pub(crate) async fn delete_interactions(
    State(state): State<ProxyState>,
) -> Result<StatusCode, ApiError> {
    let removed = state.store.delete_all().await?;
    tracing::info!(removed, "Cleared interaction store");
    Ok(StatusCode::NO_CONTENT)
}
