//! One live tunnel and its in-flight state
//!
//! A [`Tunnel`] owns everything multiplexed over one control connection:
//! pending HTTP requests, active response streams, browser WebSockets and
//! pending WebSocket upgrades, plus the two single slots that pair incoming
//! binary frames with the message that announced them.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use burrow_proto::messages::Headers;
use burrow_proto::{ControlMessage, Frame};

/// Buffered capacity of one response stream; the producer (control-channel
/// reader) blocks when the public-side writer falls this far behind.
const STREAM_BUFFER_CHUNKS: usize = 32;

/// A response stream aborted before completion.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StreamAbort(pub String);

/// Body of a completed tunnel response.
#[derive(Debug)]
pub enum ResponseBody {
    Buffered(Bytes),
    Streamed {
        total_size: Option<u64>,
        body: mpsc::Receiver<Result<Bytes, StreamAbort>>,
    },
}

/// A response delivered to a waiting dispatcher.
#[derive(Debug)]
pub struct TunnelResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: ResponseBody,
}

/// A frame relayed to a browser-side WebSocket task.
#[derive(Debug)]
pub enum SocketFrame {
    Text(String),
    Binary(Bytes),
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// What the control-connection writer task consumes.
#[derive(Debug)]
pub enum Outgoing {
    Frame(Frame),
    /// Close the control connection with the given WebSocket close code.
    Close { code: u16, reason: String },
}

/// The control connection is gone; the frame was not sent.
#[derive(Debug, Error)]
#[error("tunnel disconnected")]
pub struct TunnelClosed;

/// Outcome of a pending browser WebSocket upgrade: the negotiated
/// subprotocol on success, the client-reported error otherwise.
pub type UpgradeResult = Result<Option<String>, String>;

#[derive(Debug)]
struct BinaryHeader {
    request_id: Uuid,
    status: u16,
    headers: Headers,
}

struct ActiveStream {
    body: mpsc::Sender<Result<Bytes, StreamAbort>>,
    /// Set while the last message on this stream was a chunk announcement
    /// whose binary frame has not arrived yet.
    pending_chunk: Option<u32>,
}

#[derive(Default)]
struct Tables {
    pending: HashMap<Uuid, oneshot::Sender<TunnelResponse>>,
    streams: HashMap<Uuid, ActiveStream>,
    sockets: HashMap<Uuid, mpsc::UnboundedSender<SocketFrame>>,
    upgrades: HashMap<Uuid, oneshot::Sender<UpgradeResult>>,
    /// The most recent `http_response_binary` header awaiting its body.
    pending_binary: Option<BinaryHeader>,
    /// The most recent `ws_message_binary` target awaiting its payload.
    pending_ws_binary: Option<Uuid>,
}

/// One registered tunnel.
pub struct Tunnel {
    subdomain: String,
    api_key: String,
    created_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    tables: Mutex<Tables>,
}

impl Tunnel {
    pub fn new(subdomain: String, api_key: String, outbound: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            subdomain,
            api_key,
            created_at: Utc::now(),
            outbound,
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the control connection still has a writer draining frames.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn send(&self, msg: ControlMessage) -> Result<(), TunnelClosed> {
        self.send_frame(Frame::Message(msg))
    }

    pub fn send_frame(&self, frame: Frame) -> Result<(), TunnelClosed> {
        self.outbound
            .send(Outgoing::Frame(frame))
            .map_err(|_| TunnelClosed)
    }

    /// Ask the control loop to close the connection with `code`/`reason`.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.send(Outgoing::Close {
            code,
            reason: reason.to_string(),
        });
    }

    // ---- pending HTTP requests ----

    /// Register a pending request before its `http_request` goes on the wire.
    pub fn begin_request(&self, request_id: Uuid) -> oneshot::Receiver<TunnelResponse> {
        let (tx, rx) = oneshot::channel();
        self.tables.lock().unwrap().pending.insert(request_id, tx);
        rx
    }

    /// Drop a pending request (timeout or caller gone).
    pub fn cancel_request(&self, request_id: Uuid) {
        if self
            .tables
            .lock()
            .unwrap()
            .pending
            .remove(&request_id)
            .is_some()
        {
            debug!(%request_id, "cancelled pending request");
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.tables.lock().unwrap().pending.len()
    }

    // ---- browser WebSockets ----

    pub fn begin_ws_upgrade(&self, ws_id: Uuid) -> oneshot::Receiver<UpgradeResult> {
        let (tx, rx) = oneshot::channel();
        self.tables.lock().unwrap().upgrades.insert(ws_id, tx);
        rx
    }

    pub fn cancel_ws_upgrade(&self, ws_id: Uuid) {
        self.tables.lock().unwrap().upgrades.remove(&ws_id);
    }

    pub fn register_socket(&self, ws_id: Uuid, tx: mpsc::UnboundedSender<SocketFrame>) {
        self.tables.lock().unwrap().sockets.insert(ws_id, tx);
    }

    pub fn remove_socket(&self, ws_id: Uuid) -> bool {
        self.tables.lock().unwrap().sockets.remove(&ws_id).is_some()
    }

    // ---- inbound routing ----

    /// Route one client-to-server control message into the tables.
    ///
    /// Replays for unknown or already-completed ids are no-ops; messages that
    /// only ever travel server-to-client are logged and dropped.
    pub fn handle_message(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::HttpResponse {
                request_id,
                status,
                headers,
                body,
            } => {
                self.complete_request(
                    request_id,
                    status,
                    headers,
                    ResponseBody::Buffered(Bytes::from(body.into_bytes())),
                );
            }
            ControlMessage::HttpResponseBinary {
                request_id,
                status,
                headers,
                body_size,
            } => {
                let mut tables = self.tables.lock().unwrap();
                if let Some(stale) = tables.pending_binary.take() {
                    // Two announcements without a binary frame in between is a
                    // protocol violation; the first header is lost.
                    warn!(
                        subdomain = %self.subdomain,
                        stale = %stale.request_id,
                        new = %request_id,
                        "binary response announced while a previous announcement was unresolved; discarding the first"
                    );
                }
                debug!(%request_id, body_size, "awaiting binary response body");
                tables.pending_binary = Some(BinaryHeader {
                    request_id,
                    status,
                    headers,
                });
            }
            ControlMessage::HttpResponseStreamStart {
                request_id,
                status,
                headers,
                total_size,
            } => {
                let (body_tx, body_rx) = mpsc::channel(STREAM_BUFFER_CHUNKS);
                let mut tables = self.tables.lock().unwrap();
                let Some(waiter) = tables.pending.remove(&request_id) else {
                    debug!(%request_id, "stream started for unknown request; ignoring");
                    return;
                };
                tables.streams.insert(
                    request_id,
                    ActiveStream {
                        body: body_tx,
                        pending_chunk: None,
                    },
                );
                drop(tables);
                let response = TunnelResponse {
                    status,
                    headers,
                    body: ResponseBody::Streamed {
                        total_size,
                        body: body_rx,
                    },
                };
                if waiter.send(response).is_err() {
                    // Public side went away between dispatch and stream start.
                    self.tables.lock().unwrap().streams.remove(&request_id);
                    debug!(%request_id, "stream receiver dropped before start");
                }
            }
            ControlMessage::HttpResponseStreamChunk {
                request_id,
                chunk_size,
            } => {
                let mut tables = self.tables.lock().unwrap();
                match tables.streams.get_mut(&request_id) {
                    Some(stream) => {
                        if stream.pending_chunk.is_some() {
                            warn!(%request_id, "chunk announced while a previous chunk payload is outstanding");
                        }
                        stream.pending_chunk = Some(chunk_size);
                    }
                    None => {
                        warn!(%request_id, "chunk announced for unknown stream");
                    }
                }
            }
            ControlMessage::HttpResponseStreamEnd { request_id } => {
                // Dropping the sender closes the public-side body cleanly.
                if self
                    .tables
                    .lock()
                    .unwrap()
                    .streams
                    .remove(&request_id)
                    .is_none()
                {
                    debug!(%request_id, "stream end for unknown stream");
                }
            }
            ControlMessage::HttpResponseStreamError { request_id, error } => {
                let removed = self.tables.lock().unwrap().streams.remove(&request_id);
                if let Some(stream) = removed {
                    warn!(%request_id, %error, "stream aborted by client");
                    tokio::spawn(async move {
                        let _ = stream.body.send(Err(StreamAbort(error))).await;
                    });
                }
            }
            ControlMessage::Pong => {}
            ControlMessage::WsOpened { ws_id, protocol } => {
                if let Some(waiter) = self.tables.lock().unwrap().upgrades.remove(&ws_id) {
                    let _ = waiter.send(Ok(protocol));
                } else {
                    debug!(%ws_id, "ws_opened for unknown upgrade");
                }
            }
            ControlMessage::WsError { ws_id, error } => {
                if let Some(waiter) = self.tables.lock().unwrap().upgrades.remove(&ws_id) {
                    let _ = waiter.send(Err(error));
                } else {
                    debug!(%ws_id, %error, "ws_error for unknown upgrade");
                }
            }
            ControlMessage::WsMessage { ws_id, data } => {
                self.forward_socket_frame(ws_id, SocketFrame::Text(data));
            }
            ControlMessage::WsMessageBinary { ws_id } => {
                let mut tables = self.tables.lock().unwrap();
                if let Some(stale) = tables.pending_ws_binary.replace(ws_id) {
                    warn!(%stale, %ws_id, "ws binary announced while a previous announcement was unresolved");
                }
            }
            ControlMessage::WsClose {
                ws_id,
                code,
                reason,
            } => {
                let removed = self.tables.lock().unwrap().sockets.remove(&ws_id);
                if let Some(socket) = removed {
                    let _ = socket.send(SocketFrame::Close { code, reason });
                }
            }
            other => {
                warn!(
                    subdomain = %self.subdomain,
                    r#type = other.type_name(),
                    "unexpected message direction on control channel"
                );
            }
        }
    }

    /// Route one raw binary frame to whichever announcement is waiting.
    ///
    /// Slots are consulted in a fixed order: the binary response header, then
    /// the unique stream awaiting a chunk, then the WebSocket target. A frame
    /// nothing announced is dropped.
    pub async fn handle_binary(&self, payload: Bytes) {
        enum Route {
            CompleteRequest(BinaryHeader),
            StreamChunk(Uuid, mpsc::Sender<Result<Bytes, StreamAbort>>, u32),
            Socket(Uuid),
            Unpaired,
        }

        let route = {
            let mut tables = self.tables.lock().unwrap();
            if let Some(header) = tables.pending_binary.take() {
                Route::CompleteRequest(header)
            } else if let Some((id, stream)) = tables
                .streams
                .iter_mut()
                .find(|(_, s)| s.pending_chunk.is_some())
            {
                let announced = stream.pending_chunk.take().unwrap_or_default();
                Route::StreamChunk(*id, stream.body.clone(), announced)
            } else if let Some(ws_id) = tables.pending_ws_binary.take() {
                Route::Socket(ws_id)
            } else {
                Route::Unpaired
            }
        };

        match route {
            Route::CompleteRequest(header) => {
                self.complete_request(
                    header.request_id,
                    header.status,
                    header.headers,
                    ResponseBody::Buffered(payload),
                );
            }
            Route::StreamChunk(request_id, body, announced) => {
                if announced as usize != payload.len() {
                    debug!(
                        %request_id,
                        announced,
                        actual = payload.len(),
                        "chunk size mismatch; using actual frame length"
                    );
                }
                // Applies backpressure from the public-side writer.
                if body.send(Ok(payload)).await.is_err() {
                    debug!(%request_id, "public side gone; dropping stream");
                    self.tables.lock().unwrap().streams.remove(&request_id);
                }
            }
            Route::Socket(ws_id) => {
                self.forward_socket_frame(ws_id, SocketFrame::Binary(payload));
            }
            Route::Unpaired => {
                warn!(
                    subdomain = %self.subdomain,
                    len = payload.len(),
                    "binary frame with no announcement; dropping"
                );
            }
        }
    }

    /// Tear down every table entry. Pending requests observe a dropped
    /// completion channel, streams an abort, upgrades a rejection and browser
    /// sockets a going-away close.
    pub fn shutdown(&self, reason: &str) {
        let tables = {
            let mut guard = self.tables.lock().unwrap();
            std::mem::take(&mut *guard)
        };

        let pending = tables.pending.len();
        let streams = tables.streams.len();
        let sockets = tables.sockets.len();
        if pending + streams + sockets + tables.upgrades.len() > 0 {
            debug!(
                subdomain = %self.subdomain,
                pending, streams, sockets,
                upgrades = tables.upgrades.len(),
                %reason,
                "tearing down tunnel state"
            );
        }

        drop(tables.pending); // waiters see RecvError

        for (_, stream) in tables.streams {
            let abort = StreamAbort(reason.to_string());
            tokio::spawn(async move {
                let _ = stream.body.send(Err(abort)).await;
            });
        }
        for (_, waiter) in tables.upgrades {
            let _ = waiter.send(Err(reason.to_string()));
        }
        for (_, socket) in tables.sockets {
            let _ = socket.send(SocketFrame::Close {
                code: Some(1001),
                reason: Some(reason.to_string()),
            });
        }
    }

    fn complete_request(&self, request_id: Uuid, status: u16, headers: Headers, body: ResponseBody) {
        let waiter = self.tables.lock().unwrap().pending.remove(&request_id);
        match waiter {
            Some(tx) => {
                if tx.send(TunnelResponse {
                    status,
                    headers,
                    body,
                })
                .is_err()
                {
                    debug!(%request_id, "response receiver dropped before completion");
                }
            }
            None => {
                debug!(%request_id, "response for unknown or completed request; ignoring");
            }
        }
    }

    fn forward_socket_frame(&self, ws_id: Uuid, frame: SocketFrame) {
        let socket = self
            .tables
            .lock()
            .unwrap()
            .sockets
            .get(&ws_id)
            .cloned();
        match socket {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => debug!(%ws_id, "frame for unknown browser socket; dropping"),
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("subdomain", &self.subdomain)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel() -> (Tunnel, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Tunnel::new("test-sub".to_string(), "key".to_string(), tx),
            rx,
        )
    }

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_buffered_response_completes_request() {
        let (tunnel, _rx) = tunnel();
        let id = Uuid::new_v4();
        let waiter = tunnel.begin_request(id);

        tunnel.handle_message(ControlMessage::HttpResponse {
            request_id: id,
            status: 200,
            headers: headers(&[("content-type", "text/plain")]),
            body: "hello".to_string(),
        });

        let response = waiter.await.unwrap();
        assert_eq!(response.status, 200);
        match response.body {
            ResponseBody::Buffered(bytes) => assert_eq!(&bytes[..], b"hello"),
            other => panic!("expected buffered body, got {:?}", other),
        }
        assert_eq!(tunnel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_binary_response_pairs_with_next_frame() {
        let (tunnel, _rx) = tunnel();
        let id = Uuid::new_v4();
        let waiter = tunnel.begin_request(id);

        tunnel.handle_message(ControlMessage::HttpResponseBinary {
            request_id: id,
            status: 200,
            headers: Headers::new(),
            body_size: 3, // advisory; actual frame is longer
        });
        tunnel.handle_binary(Bytes::from_static(b"abcdef")).await;

        let response = waiter.await.unwrap();
        match response.body {
            ResponseBody::Buffered(bytes) => assert_eq!(&bytes[..], b"abcdef"),
            other => panic!("expected buffered body, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_double_binary_announcement_discards_first() {
        let (tunnel, _rx) = tunnel();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let first_waiter = tunnel.begin_request(first);
        let second_waiter = tunnel.begin_request(second);

        tunnel.handle_message(ControlMessage::HttpResponseBinary {
            request_id: first,
            status: 200,
            headers: Headers::new(),
            body_size: 1,
        });
        tunnel.handle_message(ControlMessage::HttpResponseBinary {
            request_id: second,
            status: 201,
            headers: Headers::new(),
            body_size: 1,
        });
        tunnel.handle_binary(Bytes::from_static(b"x")).await;

        let response = second_waiter.await.unwrap();
        assert_eq!(response.status, 201);
        // The discarded announcement never completes its request.
        drop(tunnel);
        assert!(first_waiter.await.is_err());
    }

    #[tokio::test]
    async fn test_stream_lifecycle() {
        let (tunnel, _rx) = tunnel();
        let id = Uuid::new_v4();
        let waiter = tunnel.begin_request(id);

        tunnel.handle_message(ControlMessage::HttpResponseStreamStart {
            request_id: id,
            status: 200,
            headers: headers(&[("content-type", "application/octet-stream")]),
            total_size: Some(6),
        });

        let response = waiter.await.unwrap();
        let ResponseBody::Streamed {
            total_size,
            mut body,
        } = response.body
        else {
            panic!("expected streamed body");
        };
        assert_eq!(total_size, Some(6));

        tunnel.handle_message(ControlMessage::HttpResponseStreamChunk {
            request_id: id,
            chunk_size: 3,
        });
        tunnel.handle_binary(Bytes::from_static(b"abc")).await;
        tunnel.handle_message(ControlMessage::HttpResponseStreamChunk {
            request_id: id,
            chunk_size: 3,
        });
        tunnel.handle_binary(Bytes::from_static(b"def")).await;
        tunnel.handle_message(ControlMessage::HttpResponseStreamEnd { request_id: id });

        assert_eq!(body.recv().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(body.recv().await.unwrap().unwrap(), Bytes::from_static(b"def"));
        assert!(body.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_error_aborts_body() {
        let (tunnel, _rx) = tunnel();
        let id = Uuid::new_v4();
        let waiter = tunnel.begin_request(id);

        tunnel.handle_message(ControlMessage::HttpResponseStreamStart {
            request_id: id,
            status: 200,
            headers: Headers::new(),
            total_size: None,
        });
        let ResponseBody::Streamed { mut body, .. } = waiter.await.unwrap().body else {
            panic!("expected streamed body");
        };

        tunnel.handle_message(ControlMessage::HttpResponseStreamError {
            request_id: id,
            error: "upstream reset".to_string(),
        });

        let err = body.recv().await.unwrap().unwrap_err();
        assert_eq!(err.0, "upstream reset");
    }

    #[tokio::test]
    async fn test_ws_binary_slot_order() {
        let (tunnel, _rx) = tunnel();
        let request_id = Uuid::new_v4();
        let ws_id = Uuid::new_v4();
        let waiter = tunnel.begin_request(request_id);

        let (socket_tx, mut socket_rx) = mpsc::unbounded_channel();
        tunnel.register_socket(ws_id, socket_tx);

        // Both an HTTP binary header and a WS binary target are pending; the
        // HTTP slot wins the first frame, the WS slot the second.
        tunnel.handle_message(ControlMessage::HttpResponseBinary {
            request_id,
            status: 200,
            headers: Headers::new(),
            body_size: 2,
        });
        tunnel.handle_message(ControlMessage::WsMessageBinary { ws_id });

        tunnel.handle_binary(Bytes::from_static(b"http")).await;
        tunnel.handle_binary(Bytes::from_static(b"sock")).await;

        let response = waiter.await.unwrap();
        match response.body {
            ResponseBody::Buffered(bytes) => assert_eq!(&bytes[..], b"http"),
            other => panic!("expected buffered body, got {:?}", other),
        }
        match socket_rx.recv().await.unwrap() {
            SocketFrame::Binary(bytes) => assert_eq!(&bytes[..], b"sock"),
            other => panic!("expected binary socket frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unpaired_binary_dropped() {
        let (tunnel, _rx) = tunnel();
        // Nothing announced; must not panic or route anywhere.
        tunnel.handle_binary(Bytes::from_static(b"stray")).await;
    }

    #[tokio::test]
    async fn test_chunk_for_unknown_stream_drops_payload() {
        let (tunnel, _rx) = tunnel();
        let id = Uuid::new_v4();

        // No stream was ever started for this id: the announcement cannot
        // arm a slot, and the following binary frame falls through to drop.
        tunnel.handle_message(ControlMessage::HttpResponseStreamChunk {
            request_id: id,
            chunk_size: 3,
        });
        tunnel.handle_binary(Bytes::from_static(b"abc")).await;
    }

    #[tokio::test]
    async fn test_socket_removed_after_close() {
        let (tunnel, _rx) = tunnel();
        let ws_id = Uuid::new_v4();
        let (socket_tx, mut socket_rx) = mpsc::unbounded_channel();
        tunnel.register_socket(ws_id, socket_tx);

        tunnel.handle_message(ControlMessage::WsClose {
            ws_id,
            code: Some(1000),
            reason: None,
        });
        assert!(matches!(
            socket_rx.recv().await,
            Some(SocketFrame::Close { code: Some(1000), .. })
        ));

        // Frames after the close are dropped, not delivered.
        tunnel.handle_message(ControlMessage::WsMessage {
            ws_id,
            data: "late".to_string(),
        });
        assert!(socket_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_is_open_tracks_writer() {
        let (tunnel, rx) = tunnel();
        assert!(tunnel.is_open());
        drop(rx);
        assert!(!tunnel.is_open());
        assert!(tunnel.send(ControlMessage::Ping).is_err());
    }

    #[tokio::test]
    async fn test_replayed_response_is_noop() {
        let (tunnel, _rx) = tunnel();
        let id = Uuid::new_v4();
        let waiter = tunnel.begin_request(id);

        let response = ControlMessage::HttpResponse {
            request_id: id,
            status: 200,
            headers: Headers::new(),
            body: "first".to_string(),
        };
        tunnel.handle_message(response.clone());
        tunnel.handle_message(response);

        assert_eq!(waiter.await.unwrap().status, 200);
        assert_eq!(tunnel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_ws_upgrade_resolution() {
        let (tunnel, _rx) = tunnel();
        let ok_id = Uuid::new_v4();
        let err_id = Uuid::new_v4();

        let ok_waiter = tunnel.begin_ws_upgrade(ok_id);
        let err_waiter = tunnel.begin_ws_upgrade(err_id);

        tunnel.handle_message(ControlMessage::WsOpened {
            ws_id: ok_id,
            protocol: Some("chat".to_string()),
        });
        tunnel.handle_message(ControlMessage::WsError {
            ws_id: err_id,
            error: "connection refused".to_string(),
        });

        assert_eq!(ok_waiter.await.unwrap(), Ok(Some("chat".to_string())));
        assert_eq!(
            err_waiter.await.unwrap(),
            Err("connection refused".to_string())
        );
    }

    #[tokio::test]
    async fn test_shutdown_rejects_everything() {
        let (tunnel, _rx) = tunnel();
        let request_id = Uuid::new_v4();
        let stream_id = Uuid::new_v4();
        let ws_id = Uuid::new_v4();
        let upgrade_id = Uuid::new_v4();

        let request_waiter = tunnel.begin_request(request_id);
        let stream_waiter = tunnel.begin_request(stream_id);
        let upgrade_waiter = tunnel.begin_ws_upgrade(upgrade_id);
        let (socket_tx, mut socket_rx) = mpsc::unbounded_channel();
        tunnel.register_socket(ws_id, socket_tx);

        tunnel.handle_message(ControlMessage::HttpResponseStreamStart {
            request_id: stream_id,
            status: 200,
            headers: Headers::new(),
            total_size: None,
        });
        let ResponseBody::Streamed { mut body, .. } = stream_waiter.await.unwrap().body else {
            panic!("expected streamed body");
        };

        tunnel.shutdown("tunnel disconnected");

        assert!(request_waiter.await.is_err());
        assert_eq!(
            body.recv().await.unwrap().unwrap_err().0,
            "tunnel disconnected"
        );
        assert_eq!(
            upgrade_waiter.await.unwrap(),
            Err("tunnel disconnected".to_string())
        );
        match socket_rx.recv().await.unwrap() {
            SocketFrame::Close { code, reason } => {
                assert_eq!(code, Some(1001));
                assert_eq!(reason.as_deref(), Some("tunnel disconnected"));
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}
