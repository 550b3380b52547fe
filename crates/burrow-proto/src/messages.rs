//! Control-channel message types
//!
//! Every text frame on a control connection is one JSON object with a `type`
//! discriminator. Three message kinds (`http_response_binary`,
//! `http_response_stream_chunk`, `ws_message_binary`) announce that the very
//! next binary frame on the same connection carries their payload; see
//! [`ControlMessage::announces_binary`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Header snapshot carried inside request/response messages.
///
/// Names are lowercase on the wire; both ends compare them
/// case-insensitively.
pub type Headers = HashMap<String, String>;

/// Main control protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    // Server -> client
    /// Sent once after a successful authenticated upgrade.
    Connected { subdomain: String },
    /// A public request forwarded to the client. The body travels inline as a
    /// UTF-8 string; request bodies are read fully before forwarding.
    HttpRequest {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        method: String,
        path: String,
        headers: Headers,
        body: String,
    },
    /// Advisory server-side timing, emitted after the public response has
    /// been produced.
    RequestTiming {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        /// Milliseconds between request arrival and response production.
        duration: u64,
    },
    Ping,
    Error { message: String },
    /// A browser initiated a WebSocket upgrade on the public side.
    WsOpen {
        #[serde(rename = "wsId")]
        ws_id: Uuid,
        path: String,
        headers: Headers,
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },

    // Client -> server
    /// A buffered text response; `body` is the UTF-8 payload.
    HttpResponse {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        status: u16,
        headers: Headers,
        body: String,
    },
    /// A buffered binary response. Exactly one binary frame follows with the
    /// body; `body_size` is advisory, the frame length prevails.
    HttpResponseBinary {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        status: u16,
        headers: Headers,
        #[serde(rename = "bodySize")]
        body_size: u64,
    },
    /// Switches the request to streaming delivery. `total_size` is absent for
    /// unbounded streams (SSE).
    HttpResponseStreamStart {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        status: u16,
        headers: Headers,
        #[serde(rename = "totalSize", skip_serializing_if = "Option::is_none")]
        total_size: Option<u64>,
    },
    /// One stream chunk; exactly one binary frame follows with the bytes.
    HttpResponseStreamChunk {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        #[serde(rename = "chunkSize")]
        chunk_size: u32,
    },
    HttpResponseStreamEnd {
        #[serde(rename = "requestId")]
        request_id: Uuid,
    },
    HttpResponseStreamError {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        error: String,
    },
    Pong,
    /// The client opened the loopback WebSocket for a pending upgrade.
    WsOpened {
        #[serde(rename = "wsId")]
        ws_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
    /// The loopback WebSocket could not be opened.
    WsError {
        #[serde(rename = "wsId")]
        ws_id: Uuid,
        error: String,
    },

    // Both directions
    /// A text message on a tunnelled WebSocket.
    WsMessage {
        #[serde(rename = "wsId")]
        ws_id: Uuid,
        data: String,
    },
    /// A binary message on a tunnelled WebSocket; exactly one binary frame
    /// follows with the payload.
    WsMessageBinary {
        #[serde(rename = "wsId")]
        ws_id: Uuid,
    },
    /// One side of a tunnelled WebSocket closed.
    WsClose {
        #[serde(rename = "wsId")]
        ws_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ControlMessage {
    /// Whether the very next binary frame on the connection belongs to this
    /// message.
    pub fn announces_binary(&self) -> bool {
        matches!(
            self,
            ControlMessage::HttpResponseBinary { .. }
                | ControlMessage::HttpResponseStreamChunk { .. }
                | ControlMessage::WsMessageBinary { .. }
        )
    }

    /// The wire value of the `type` discriminator.
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::Connected { .. } => "connected",
            ControlMessage::HttpRequest { .. } => "http_request",
            ControlMessage::RequestTiming { .. } => "request_timing",
            ControlMessage::Ping => "ping",
            ControlMessage::Error { .. } => "error",
            ControlMessage::WsOpen { .. } => "ws_open",
            ControlMessage::HttpResponse { .. } => "http_response",
            ControlMessage::HttpResponseBinary { .. } => "http_response_binary",
            ControlMessage::HttpResponseStreamStart { .. } => "http_response_stream_start",
            ControlMessage::HttpResponseStreamChunk { .. } => "http_response_stream_chunk",
            ControlMessage::HttpResponseStreamEnd { .. } => "http_response_stream_end",
            ControlMessage::HttpResponseStreamError { .. } => "http_response_stream_error",
            ControlMessage::Pong => "pong",
            ControlMessage::WsOpened { .. } => "ws_opened",
            ControlMessage::WsError { .. } => "ws_error",
            ControlMessage::WsMessage { .. } => "ws_message",
            ControlMessage::WsMessageBinary { .. } => "ws_message_binary",
            ControlMessage::WsClose { .. } => "ws_close",
        }
    }
}

/// Every `type` value this protocol version understands. Text frames with a
/// `type` outside this list are ignored for forward compatibility.
pub(crate) const KNOWN_TYPES: &[&str] = &[
    "connected",
    "http_request",
    "request_timing",
    "ping",
    "error",
    "ws_open",
    "http_response",
    "http_response_binary",
    "http_response_stream_start",
    "http_response_stream_chunk",
    "http_response_stream_end",
    "http_response_stream_error",
    "pong",
    "ws_opened",
    "ws_error",
    "ws_message",
    "ws_message_binary",
    "ws_close",
];
