//! Browser WebSocket passthrough
//!
//! A browser upgrade on a tunnelled hostname becomes a `ws_open` handshake
//! over the control channel; once the client confirms it reached the loopback
//! server, the browser upgrade completes and the two sockets relay through
//! the tunnel for their whole lifetime.

use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Request, WebSocketUpgrade,
    },
    http::StatusCode,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use burrow_control::{SocketFrame, Tunnel};
use burrow_proto::{ControlMessage, Frame};

use crate::dispatch::{plain, snapshot_headers};

/// How long the client gets to open the loopback socket.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle a browser upgrade for a known tunnel.
pub async fn handle(tunnel: Arc<Tunnel>, ws: WebSocketUpgrade, req: Request) -> Response {
    let ws_id = Uuid::new_v4();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = snapshot_headers(req.headers());
    let protocol = req
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    let waiter = tunnel.begin_ws_upgrade(ws_id);
    let open = ControlMessage::WsOpen {
        ws_id,
        path,
        headers,
        protocol,
    };
    if tunnel.send(open).is_err() {
        tunnel.cancel_ws_upgrade(ws_id);
        return plain(StatusCode::BAD_GATEWAY, "Tunnel disconnected");
    }

    let negotiated = match tokio::time::timeout(UPGRADE_TIMEOUT, waiter).await {
        Err(_) => {
            tunnel.cancel_ws_upgrade(ws_id);
            return plain(StatusCode::BAD_GATEWAY, "WebSocket upgrade timed out");
        }
        Ok(Err(_)) => return plain(StatusCode::BAD_GATEWAY, "Tunnel disconnected"),
        Ok(Ok(Err(error))) => {
            warn!(%ws_id, %error, "client could not open loopback WebSocket");
            return plain(StatusCode::BAD_GATEWAY, &error);
        }
        Ok(Ok(Ok(protocol))) => protocol,
    };

    let ws = match &negotiated {
        Some(protocol) => ws.protocols([protocol.clone()]),
        None => ws,
    };
    ws.on_upgrade(move |socket| browser_socket(socket, tunnel, ws_id))
}

/// Relay one browser socket until either side closes.
async fn browser_socket(socket: WebSocket, tunnel: Arc<Tunnel>, ws_id: Uuid) {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    tunnel.register_socket(ws_id, frames_tx);
    debug!(%ws_id, subdomain = %tunnel.subdomain(), "browser socket open");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = frames_rx.recv() => match frame {
                None => {
                    // Tunnel torn down with no close frame queued.
                    let _ = sink.close().await;
                    break;
                }
                Some(SocketFrame::Text(data)) => {
                    if sink.send(Message::Text(data.into())).await.is_err() {
                        let _ = tunnel.send(ControlMessage::WsClose { ws_id, code: None, reason: None });
                        break;
                    }
                }
                Some(SocketFrame::Binary(data)) => {
                    if sink.send(Message::Binary(data)).await.is_err() {
                        let _ = tunnel.send(ControlMessage::WsClose { ws_id, code: None, reason: None });
                        break;
                    }
                }
                Some(SocketFrame::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: code.unwrap_or(1000),
                            reason: reason.unwrap_or_default().into(),
                        })))
                        .await;
                    break;
                }
            },
            msg = stream.next() => match msg {
                None | Some(Err(_)) => {
                    let _ = tunnel.send(ControlMessage::WsClose { ws_id, code: None, reason: None });
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = tunnel.send(ControlMessage::WsMessage {
                        ws_id,
                        data: text.to_string(),
                    });
                }
                Some(Ok(Message::Binary(payload))) => {
                    let _ = tunnel.send_frame(Frame::WithPayload(
                        ControlMessage::WsMessageBinary { ws_id },
                        payload,
                    ));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (
                            Some(frame.code),
                            (!frame.reason.is_empty()).then(|| frame.reason.to_string()),
                        ),
                        None => (None, None),
                    };
                    let _ = tunnel.send(ControlMessage::WsClose { ws_id, code, reason });
                    break;
                }
                Some(Ok(_)) => {} // protocol ping/pong
            }
        }
    }

    tunnel.remove_socket(ws_id);
    debug!(%ws_id, "browser socket closed");
}
