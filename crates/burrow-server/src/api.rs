//! HTTP surface of the tunnel server

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::{auth, control, dispatch, AppState};

/// Build the full router: the reserved `/__tunnel__` endpoints plus the
/// wildcard dispatcher for everything else.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/__tunnel__/health", get(health))
        .route("/__tunnel__/verify", get(verify))
        .route("/__tunnel__/status", get(status))
        .route("/__tunnel__/connect", get(control::connect))
        .fallback(dispatch::dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness probe; deliberately unauthenticated.
async fn health() -> &'static str {
    "OK"
}

/// Lets a client check its key before connecting.
async fn verify(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if auth::authorize(&headers, &state.config.api_key) {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::UNAUTHORIZED, "Invalid API key").into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    active_tunnels: usize,
    tunnels: Vec<TunnelEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TunnelEntry {
    subdomain: String,
    /// Epoch milliseconds.
    created_at: i64,
    pending_requests: usize,
}

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !auth::authorize(&headers, &state.config.api_key) {
        return (StatusCode::UNAUTHORIZED, "Invalid API key").into_response();
    }

    let tunnels: Vec<TunnelEntry> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|tunnel| TunnelEntry {
            subdomain: tunnel.subdomain().to_string(),
            created_at: tunnel.created_at().timestamp_millis(),
            pending_requests: tunnel.pending_requests(),
        })
        .collect();

    Json(StatusResponse {
        active_tunnels: tunnels.len(),
        tunnels,
    })
    .into_response()
}
