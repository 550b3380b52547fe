//! Public request dispatcher
//!
//! Every request that is not a `/__tunnel__` endpoint lands here. The
//! subdomain comes from the `X-Tunnel-Subdomain` header when the edge proxy
//! sets it, otherwise from the leftmost label of the Host header. The request
//! is forwarded over the control channel and the handler waits on a one-shot
//! completion that the tunnel fills in with a buffered or streamed body.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{FromRequestParts, Request, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use burrow_control::{ResponseBody, TunnelResponse};
use burrow_proto::messages::Headers;
use burrow_proto::ControlMessage;

use crate::{passthrough, AppState};

/// How long a pending request may wait for its first response message.
/// Cancelled once the client switches the request to streaming delivery.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SUBDOMAIN_HEADER: &str = "x-tunnel-subdomain";

/// Fallback handler for all public traffic.
pub async fn dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let Some(subdomain) = resolve_subdomain(req.headers()) else {
        return plain(StatusCode::NOT_FOUND, "Tunnel not found");
    };
    let Some(tunnel) = state.registry.get(&subdomain) else {
        debug!(%subdomain, "request for unknown tunnel");
        return plain(StatusCode::NOT_FOUND, "Tunnel not found");
    };

    if is_websocket_upgrade(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => {
                let req = Request::from_parts(parts, Body::empty());
                passthrough::handle(tunnel, ws, req).await
            }
            Err(rejection) => rejection.into_response(),
        };
    }

    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = snapshot_headers(&parts.headers);

    // Bodies travel inline inside the request message, so read fully up
    // front. GET/HEAD carry none.
    let body_bytes = if parts.method == Method::GET || parts.method == Method::HEAD {
        Bytes::new()
    } else {
        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%subdomain, error = %e, "failed to read request body");
                return plain(StatusCode::BAD_GATEWAY, "Failed to read request body");
            }
        }
    };

    let request_id = Uuid::new_v4();
    let started = Instant::now();
    let waiter = tunnel.begin_request(request_id);

    if !tunnel.is_open() {
        tunnel.cancel_request(request_id);
        return plain(StatusCode::BAD_GATEWAY, "Tunnel disconnected");
    }

    let request = ControlMessage::HttpRequest {
        request_id,
        method: parts.method.to_string(),
        path,
        headers,
        body: String::from_utf8_lossy(&body_bytes).into_owned(),
    };
    if tunnel.send(request).is_err() {
        tunnel.cancel_request(request_id);
        return plain(StatusCode::BAD_GATEWAY, "Tunnel disconnected");
    }

    match tokio::time::timeout(REQUEST_TIMEOUT, waiter).await {
        Err(_) => {
            debug!(%request_id, %subdomain, "request timed out");
            tunnel.cancel_request(request_id);
            plain(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
        }
        Ok(Err(_)) => plain(StatusCode::BAD_GATEWAY, "Tunnel disconnected"),
        Ok(Ok(response)) => {
            let out = assemble(response);
            // Advisory; never blocks the public response.
            let _ = tunnel.send(ControlMessage::RequestTiming {
                request_id,
                duration: started.elapsed().as_millis() as u64,
            });
            out
        }
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade && connection
}

/// `X-Tunnel-Subdomain` from the trusted edge, else the leftmost Host label.
fn resolve_subdomain(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(SUBDOMAIN_HEADER).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_ascii_lowercase());
        }
    }
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let host = host.split(':').next().unwrap_or(host);
    let label = host.split('.').next().unwrap_or(host);
    if label.is_empty() {
        None
    } else {
        Some(label.to_ascii_lowercase())
    }
}

/// Flatten a header map into the wire snapshot. Multi-valued headers keep
/// their last value.
pub(crate) fn snapshot_headers(headers: &HeaderMap) -> Headers {
    let mut snapshot = Headers::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            snapshot.insert(name.as_str().to_string(), value.to_string());
        }
    }
    snapshot
}

fn assemble(response: TunnelResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => debug!(header = %name, "dropping unrepresentable response header"),
        }
    }

    let body = match response.body {
        ResponseBody::Buffered(bytes) => Body::from(bytes),
        // A streamed body ends when the sender side closes; an abort surfaces
        // as a body error and the edge observes a truncated response.
        ResponseBody::Streamed { body, .. } => Body::from_stream(ReceiverStream::new(body)),
    };

    builder
        .body(body)
        .unwrap_or_else(|_| plain(StatusCode::BAD_GATEWAY, "Malformed tunnel response"))
}

pub(crate) fn plain(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}
