//! Loopback WebSocket passthrough
//!
//! For each `ws_open` from the server the client dials the same path on the
//! loopback server, reports the outcome, and then relays frames both ways:
//! the session routes server-side frames into a per-socket channel, and a
//! reader task wraps loopback frames back onto the control channel.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use uuid::Uuid;

use burrow_proto::messages::Headers;
use burrow_proto::{ControlMessage, Frame};

use crate::session::SessionShared;

/// Open the loopback socket for a pending browser upgrade and start relaying.
pub async fn open(
    shared: Arc<SessionShared>,
    ws_id: Uuid,
    path: String,
    headers: Headers,
    protocol: Option<String>,
) {
    let url = format!("ws://localhost:{}{}", shared.local_port, path);

    let mut request = http::Request::builder()
        .uri(&url)
        .header("Host", format!("localhost:{}", shared.local_port))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key());
    if let Some(protocol) = &protocol {
        request = request.header("Sec-WebSocket-Protocol", protocol);
    }
    // Pass negotiation-relevant headers through untouched.
    for (name, value) in &headers {
        if name.eq_ignore_ascii_case("origin") || name.eq_ignore_ascii_case("sec-websocket-extensions")
        {
            request = request.header(name.as_str(), value.as_str());
        }
    }
    let request = match request.body(()) {
        Ok(request) => request,
        Err(e) => {
            let _ = shared.outbound.send(Frame::Message(ControlMessage::WsError {
                ws_id,
                error: e.to_string(),
            }));
            return;
        }
    };

    let (socket, response) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(%ws_id, %url, error = %e, "failed to open loopback WebSocket");
            let _ = shared.outbound.send(Frame::Message(ControlMessage::WsError {
                ws_id,
                error: e.to_string(),
            }));
            return;
        }
    };

    let negotiated = response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    debug!(%ws_id, %url, ?negotiated, "loopback WebSocket open");

    if shared
        .outbound
        .send(Frame::Message(ControlMessage::WsOpened {
            ws_id,
            protocol: negotiated,
        }))
        .is_err()
    {
        return;
    }

    let (to_local_tx, mut to_local_rx) = mpsc::unbounded_channel::<WsMessage>();
    shared.sockets.insert(ws_id, to_local_tx);

    let (mut sink, mut stream) = socket.split();

    // Channel -> loopback socket.
    tokio::spawn(async move {
        while let Some(msg) = to_local_rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    // Loopback socket -> control channel.
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(WsMessage::Text(text)) => {
                    if shared
                        .outbound
                        .send(Frame::Message(ControlMessage::WsMessage {
                            ws_id,
                            data: text.to_string(),
                        }))
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(WsMessage::Binary(payload)) => {
                    if shared
                        .outbound
                        .send(Frame::WithPayload(
                            ControlMessage::WsMessageBinary { ws_id },
                            payload,
                        ))
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(frame) => (
                            Some(u16::from(frame.code)),
                            (!frame.reason.is_empty()).then(|| frame.reason.to_string()),
                        ),
                        None => (None, None),
                    };
                    let _ = shared.outbound.send(Frame::Message(ControlMessage::WsClose {
                        ws_id,
                        code,
                        reason,
                    }));
                    break;
                }
                Ok(_) => {} // protocol ping/pong
                Err(e) => {
                    debug!(%ws_id, error = %e, "loopback WebSocket error");
                    let _ = shared.outbound.send(Frame::Message(ControlMessage::WsClose {
                        ws_id,
                        code: None,
                        reason: None,
                    }));
                    break;
                }
            }
        }
        shared.sockets.remove(&ws_id);
        debug!(%ws_id, "loopback WebSocket closed");
    });
}
