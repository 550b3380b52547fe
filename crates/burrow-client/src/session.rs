//! One control-channel session
//!
//! Owns the WebSocket from a successful upgrade to disconnect: routes every
//! inbound message, keeps the server alive with periodic pongs, and feeds all
//! outbound frames through a single writer task so a binary payload can never
//! be separated from its announcing message.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use burrow_proto::{decode_text, ControlMessage, Frame};

use crate::config::ConfigStore;
use crate::events::{ConnectionState, EventBus, TunnelEvent};
use crate::{handler, local_ws};

/// Keepalive cadence; a pong goes out even when the server is quiet.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type ControlStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid server URL '{0}'")]
    BadUrl(String),

    #[error("server rejected connection: HTTP {status}{detail}")]
    Rejected { status: u16, detail: String },

    #[error("failed to connect: {0}")]
    Connect(#[from] tungstenite::Error),
}

pub struct SessionOptions {
    pub server_url: String,
    pub api_key: String,
    pub local_port: u16,
    pub subdomain: Option<String>,
    /// Written through whenever the server assigns a subdomain.
    pub store: Option<Arc<ConfigStore>>,
}

/// How an open session ended.
pub struct SessionClose {
    /// The subdomain observed in `connected`, for the next reconnect.
    pub subdomain: Option<String>,
}

/// Everything request handlers need from the session.
pub struct SessionShared {
    pub local_port: u16,
    pub outbound: mpsc::UnboundedSender<Frame>,
    /// Loopback WebSockets opened for passthrough, keyed by wsId.
    pub sockets: DashMap<Uuid, mpsc::UnboundedSender<WsMessage>>,
    pub events: EventBus,
    pub http: reqwest::Client,
}

/// Connect and run one session until the control channel drops.
///
/// `Err` means the dial itself failed; `Ok` means the channel was open and
/// later closed, which is the supervisor's cue to reconnect.
pub async fn run(options: &SessionOptions, events: EventBus) -> Result<SessionClose, SessionError> {
    let request = control_request(options)?;
    let (stream, _response) = connect_async(request).await.map_err(map_connect_error)?;
    info!(port = options.local_port, "control channel open");

    let (sink, mut stream) = stream.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, outbound_rx));

    let shared = Arc::new(SessionShared {
        local_port: options.local_port,
        outbound: outbound_tx,
        sockets: DashMap::new(),
        events: events.clone(),
        // Decompression stays on: this side owns content-encoding for
        // whatever it sends back over the tunnel.
        http: reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("default reqwest client"),
    });

    let mut observed: Option<String> = None;
    // The only server-side binary announcement is ws_message_binary.
    let mut pending_ws_binary: Option<Uuid> = None;

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.reset();

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if shared.outbound.send(Frame::Message(ControlMessage::Pong)).is_err() {
                    break;
                }
            }
            msg = stream.next() => match msg {
                None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "control channel error");
                    break;
                }
                Some(Ok(WsMessage::Text(text))) => match decode_text(text.as_str()) {
                    Ok(Some(msg)) => handle_control(
                        &shared,
                        options,
                        msg,
                        &mut observed,
                        &mut pending_ws_binary,
                    ),
                    Ok(None) => debug!("ignoring control message of unknown type"),
                    Err(e) => warn!(error = %e, "dropping malformed control frame"),
                },
                Some(Ok(WsMessage::Binary(payload))) => {
                    match pending_ws_binary.take() {
                        Some(ws_id) => match shared.sockets.get(&ws_id) {
                            Some(socket) => {
                                let _ = socket.send(WsMessage::Binary(payload));
                            }
                            None => debug!(%ws_id, "binary for unknown socket; dropping"),
                        },
                        None => {
                            warn!(len = payload.len(), "binary frame with no announcement; dropping");
                        }
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "server closed control channel");
                    break;
                }
                // tungstenite answers pings on its own.
                Some(Ok(_)) => {}
            }
        }
    }

    writer.abort();
    teardown(&shared);
    events.emit(TunnelEvent::ConnectionState(ConnectionState::Disconnected));

    Ok(SessionClose {
        subdomain: observed,
    })
}

fn handle_control(
    shared: &Arc<SessionShared>,
    options: &SessionOptions,
    msg: ControlMessage,
    observed: &mut Option<String>,
    pending_ws_binary: &mut Option<Uuid>,
) {
    match msg {
        ControlMessage::Connected { subdomain } => {
            info!(%subdomain, "tunnel registered");
            if let Some(store) = &options.store {
                store.remember_subdomain(options.local_port, &subdomain);
            }
            *observed = Some(subdomain.clone());
            shared
                .events
                .emit(TunnelEvent::ConnectionState(ConnectionState::Connected {
                    subdomain,
                }));
        }
        ControlMessage::Ping => {
            let _ = shared.outbound.send(Frame::Message(ControlMessage::Pong));
        }
        ControlMessage::HttpRequest {
            request_id,
            method,
            path,
            headers,
            body,
        } => {
            let shared = shared.clone();
            tokio::spawn(async move {
                handler::handle_request(shared, request_id, method, path, headers, body).await;
            });
        }
        ControlMessage::RequestTiming {
            request_id,
            duration,
        } => {
            shared.events.emit(TunnelEvent::RequestTimed {
                id: request_id,
                duration_ms: duration,
            });
        }
        ControlMessage::WsOpen {
            ws_id,
            path,
            headers,
            protocol,
        } => {
            let shared = shared.clone();
            tokio::spawn(async move {
                local_ws::open(shared, ws_id, path, headers, protocol).await;
            });
        }
        ControlMessage::WsMessage { ws_id, data } => match shared.sockets.get(&ws_id) {
            Some(socket) => {
                let _ = socket.send(WsMessage::Text(data.into()));
            }
            None => debug!(%ws_id, "message for unknown socket; dropping"),
        },
        ControlMessage::WsMessageBinary { ws_id } => {
            if let Some(stale) = pending_ws_binary.replace(ws_id) {
                warn!(%stale, %ws_id, "ws binary announced while a previous announcement was unresolved");
            }
        }
        ControlMessage::WsClose {
            ws_id,
            code,
            reason,
        } => {
            if let Some((_, socket)) = shared.sockets.remove(&ws_id) {
                let _ = socket.send(WsMessage::Close(Some(CloseFrame {
                    code: code.map(CloseCode::from).unwrap_or(CloseCode::Normal),
                    reason: reason.unwrap_or_default().into(),
                })));
            }
        }
        ControlMessage::Error { message } => {
            warn!(%message, "error from server");
        }
        other => {
            warn!(r#type = other.type_name(), "unexpected message direction on control channel");
        }
    }
}

/// Close every loopback passthrough socket after a disconnect.
fn teardown(shared: &SessionShared) {
    let count = shared.sockets.len();
    for entry in shared.sockets.iter() {
        let _ = entry.value().send(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "Tunnel disconnected".into(),
        })));
    }
    shared.sockets.clear();
    if count > 0 {
        debug!(count, "closed loopback passthrough sockets");
    }
}

/// Single writer for the control connection; frames arrive pre-paired.
async fn write_loop(
    mut sink: SplitSink<ControlStream, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        let (text, payload) = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "refusing to send malformed frame");
                continue;
            }
        };
        if sink.send(WsMessage::Text(text.into())).await.is_err() {
            break;
        }
        if let Some(bytes) = payload {
            if sink.send(WsMessage::Binary(bytes)).await.is_err() {
                break;
            }
        }
    }
}

/// Build the authenticated upgrade request for `/__tunnel__/connect`.
fn control_request(options: &SessionOptions) -> Result<http::Request<()>, SessionError> {
    let base = options.server_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(SessionError::BadUrl(options.server_url.clone()));
    };

    let mut connect_url = format!(
        "{}/__tunnel__/connect?port={}",
        ws_base, options.local_port
    );
    if let Some(subdomain) = &options.subdomain {
        connect_url.push_str("&subdomain=");
        connect_url.push_str(subdomain);
    }

    let parsed = url::Url::parse(&connect_url)
        .map_err(|_| SessionError::BadUrl(options.server_url.clone()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| SessionError::BadUrl(options.server_url.clone()))?;
    let host_header = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    http::Request::builder()
        .uri(connect_url.as_str())
        .header("Host", host_header)
        .header("X-API-Key", options.api_key.as_str())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .body(())
        .map_err(|_| SessionError::BadUrl(options.server_url.clone()))
}

fn map_connect_error(error: tungstenite::Error) -> SessionError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let detail = response
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).into_owned())
                .filter(|body| !body.is_empty())
                .map(|body| format!(" ({})", body.trim()))
                .unwrap_or_default();
            SessionError::Rejected { status, detail }
        }
        other => SessionError::Connect(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(server_url: &str, subdomain: Option<&str>) -> SessionOptions {
        SessionOptions {
            server_url: server_url.to_string(),
            api_key: "secret".to_string(),
            local_port: 3000,
            subdomain: subdomain.map(str::to_string),
            store: None,
        }
    }

    #[test]
    fn test_control_request_url() {
        let request = control_request(&options("https://tunnel.example.com", None)).unwrap();
        assert_eq!(
            request.uri().to_string(),
            "wss://tunnel.example.com/__tunnel__/connect?port=3000"
        );
        assert_eq!(request.headers()["X-API-Key"], "secret");
        assert_eq!(request.headers()["Host"], "tunnel.example.com");
    }

    #[test]
    fn test_control_request_preserves_subdomain() {
        let request =
            control_request(&options("http://127.0.0.1:3100", Some("brave-fox-abcd"))).unwrap();
        assert_eq!(
            request.uri().to_string(),
            "ws://127.0.0.1:3100/__tunnel__/connect?port=3000&subdomain=brave-fox-abcd"
        );
        assert_eq!(request.headers()["Host"], "127.0.0.1:3100");
    }

    #[test]
    fn test_control_request_rejects_bad_scheme() {
        assert!(matches!(
            control_request(&options("ftp://nope", None)),
            Err(SessionError::BadUrl(_))
        ));
    }
}
