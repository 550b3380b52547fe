//! Control-channel lifecycle
//!
//! `/__tunnel__/connect` authenticates the client, picks the subdomain
//! (explicit, sticky or freshly allocated), applies the reconnect policy and
//! upgrades to the control WebSocket. [`run_control`] then owns the
//! connection: a reader that routes frames into the [`Tunnel`] tables and a
//! single writer task that drains the outbound queue, so a binary payload can
//! never be separated from the message announcing it.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use burrow_control::{Outgoing, Tunnel};
use burrow_proto::{decode_text, subdomain, ControlMessage};

use crate::{allocator, auth, AppState};

/// Protocol-level ping cadence per tunnel.
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// A control connection this quiet is presumed dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    subdomain: Option<String>,
    port: Option<u16>,
}

/// The authenticated control-channel upgrade.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !auth::authorize(&headers, &state.config.api_key) {
        return (StatusCode::UNAUTHORIZED, "Invalid API key").into_response();
    }
    // Already validated above; kept for the tunnel record.
    let api_key = headers
        .get(auth::API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let Some(port) = params.port else {
        return (StatusCode::BAD_REQUEST, "Missing port parameter").into_response();
    };

    // Selection order: explicit ?subdomain=, then the sticky cache, then a
    // fresh allocation.
    let requested = match params.subdomain {
        Some(requested) => {
            if !subdomain::is_valid(&requested) {
                return (StatusCode::BAD_REQUEST, "Invalid subdomain format").into_response();
            }
            requested
        }
        None => match state.cache.lookup(&api_key, port) {
            Some(cached) => {
                debug!(subdomain = %cached, port, "sticky subdomain from cache");
                cached
            }
            None => loop {
                let fresh = allocator::allocate();
                if !state.registry.contains(&fresh) {
                    break fresh;
                }
            },
        },
    };

    if state.cache.reserved_by_other(&api_key, port, &requested) {
        return (
            StatusCode::CONFLICT,
            "Subdomain is reserved by another client",
        )
            .into_response();
    }

    // Reconnect policy: the same key takes over its own subdomain, a
    // different key is refused.
    if let Some(existing) = state.registry.get(&requested) {
        if auth::keys_match(existing.api_key(), &api_key) {
            info!(subdomain = %requested, "evicting previous connection for reconnect");
            existing.close(1000, "Reconnecting");
            state.registry.unregister_exact(&existing);
        } else {
            return (StatusCode::CONFLICT, "Subdomain is already in use").into_response();
        }
    }

    ws.on_upgrade(move |socket| run_control(socket, state, requested, api_key, port))
}

/// Owns one control connection from upgrade to teardown.
pub async fn run_control(
    socket: WebSocket,
    state: Arc<AppState>,
    subdomain: String,
    api_key: String,
    port: u16,
) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let tunnel = Arc::new(Tunnel::new(subdomain.clone(), api_key.clone(), outbound_tx));

    if state.registry.register(tunnel.clone()).is_err() {
        // Lost a race with a concurrent registration for the same name.
        warn!(%subdomain, "subdomain taken between upgrade and registration");
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: "Subdomain is already in use".into(),
            })))
            .await;
        return;
    }

    state.cache.insert(&api_key, port, &subdomain);

    if tunnel
        .send(ControlMessage::Connected {
            subdomain: subdomain.clone(),
        })
        .is_err()
    {
        state.registry.unregister_exact(&tunnel);
        return;
    }

    info!(%subdomain, port, "control channel established");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound_rx));
    read_loop(stream, tunnel.clone()).await;

    state.registry.unregister_exact(&tunnel);
    writer.abort();
    info!(%subdomain, "control channel closed");
}

/// Single writer for the control connection. Frames arrive pre-paired, so the
/// text message and its binary payload always hit the socket back to back.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                None => break,
                Some(Outgoing::Frame(frame)) => {
                    let (text, payload) = match frame.encode() {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            warn!(error = %e, "refusing to send malformed frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                    if let Some(bytes) = payload {
                        if sink.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Routes inbound frames until the connection dies or goes idle.
async fn read_loop(mut stream: SplitStream<WebSocket>, tunnel: Arc<Tunnel>) {
    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
            Err(_) => {
                info!(subdomain = %tunnel.subdomain(), "control channel idle; closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(subdomain = %tunnel.subdomain(), error = %e, "control channel error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => match decode_text(text.as_str()) {
                Ok(Some(msg)) => tunnel.handle_message(msg),
                Ok(None) => debug!("ignoring control message of unknown type"),
                // A malformed frame is dropped; it never closes the channel.
                Err(e) => warn!(error = %e, "dropping malformed control frame"),
            },
            Message::Binary(payload) => tunnel.handle_binary(payload).await,
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }
}
