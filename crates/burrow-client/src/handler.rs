//! Forwarded request handling
//!
//! Receives one `http_request`, replays it against the loopback server and
//! decides how the response travels back: a conditional-GET short circuit,
//! an inline body (text or binary), a fully buffered compressed stream, or a
//! chunk-by-chunk raw stream for bodies too large to buffer. SSE responses
//! always stream, for as long as the upstream keeps the body open.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use burrow_proto::messages::Headers;
use burrow_proto::{ControlMessage, Frame};

use crate::compress;
use crate::events::{RequestKind, TunnelEvent};
use crate::session::SessionShared;

/// Largest declared body that is still buffered and sent inline.
pub const INLINE_MAX: u64 = 256 * 1024;
/// Largest declared body that is still buffered for compression; anything
/// bigger streams raw.
pub const BUFFER_MAX: u64 = 100 * 1024 * 1024;
/// Inline bodies at least this big go as binary frames instead of JSON text.
pub const BINARY_MIN: usize = 64 * 1024;
/// Stream chunk size.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// How a loopback response goes back over the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// `text/event-stream` or explicit no-buffering: stream as it arrives.
    Sse,
    /// Small enough to buffer and send in one message.
    Inline,
    /// Buffered and compressed, then streamed in chunks.
    CompressedStream,
    /// Too large to buffer: forwarded chunk-by-chunk untouched.
    RawStream,
}

#[derive(Debug, Error)]
enum ForwardError {
    #[error("invalid method '{0}'")]
    Method(String),

    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Handle one forwarded request end to end.
pub async fn handle_request(
    shared: Arc<SessionShared>,
    request_id: Uuid,
    method: String,
    path: String,
    headers: Headers,
    body: String,
) {
    let kind = classify_request(&headers, &path);
    shared.events.emit(TunnelEvent::RequestStarted {
        id: request_id,
        method: method.clone(),
        path: path.clone(),
        kind,
    });

    let accept_encoding = header_get(&headers, "accept-encoding")
        .unwrap_or_default()
        .to_string();
    let if_none_match = header_get(&headers, "if-none-match").map(str::to_string);

    let response = match forward_to_loopback(&shared, &method, &path, &headers, body).await {
        Ok(response) => response,
        Err(e) => {
            warn!(%request_id, %method, %path, error = %e, "loopback request failed");
            let _ = shared.outbound.send(Frame::Message(ControlMessage::HttpResponse {
                request_id,
                status: 502,
                headers: Headers::new(),
                body: format!("Bad Gateway: {}", e),
            }));
            shared.events.emit(TunnelEvent::RequestCompleted {
                id: request_id,
                status: 502,
            });
            return;
        }
    };

    let status = response.status().as_u16();
    let mut resp_headers = snapshot_headers(response.headers());

    // Conditional GET short circuit: the app revalidated, we spare the wire.
    if status == 200 {
        if let (Some(if_none_match), Some(etag)) =
            (&if_none_match, header_get(&resp_headers, "etag"))
        {
            if etag_matches(if_none_match, etag) {
                let mut not_modified = Headers::new();
                not_modified.insert("etag".to_string(), etag.to_string());
                for name in ["cache-control", "vary"] {
                    if let Some(value) = header_get(&resp_headers, name) {
                        not_modified.insert(name.to_string(), value.to_string());
                    }
                }
                debug!(%request_id, "etag match; responding 304");
                let _ = shared.outbound.send(Frame::Message(ControlMessage::HttpResponse {
                    request_id,
                    status: 304,
                    headers: not_modified,
                    body: String::new(),
                }));
                shared.events.emit(TunnelEvent::RequestCompleted {
                    id: request_id,
                    status: 304,
                });
                return;
            }
        }
    }

    let content_length = header_get(&resp_headers, "content-length").and_then(|v| v.parse().ok());
    let content_type = header_get(&resp_headers, "content-type")
        .unwrap_or_default()
        .to_string();

    let sent_status = match classify_response(&resp_headers, content_length) {
        ResponseMode::Sse => {
            strip_headers(
                &mut resp_headers,
                &["content-length", "content-encoding", "transfer-encoding"],
            );
            stream_response(&shared, request_id, status, resp_headers, None, response).await
        }
        ResponseMode::RawStream => {
            stream_response(&shared, request_id, status, resp_headers, content_length, response)
                .await
        }
        ResponseMode::Inline | ResponseMode::CompressedStream => {
            send_buffered(
                &shared,
                request_id,
                status,
                resp_headers,
                &accept_encoding,
                &content_type,
                response,
            )
            .await
        }
    };

    if let Some(status) = sent_status {
        shared.events.emit(TunnelEvent::RequestCompleted {
            id: request_id,
            status,
        });
    }
}

/// Buffer the whole body, attempt compression, and pick the wire shape from
/// what is actually left to send.
async fn send_buffered(
    shared: &SessionShared,
    request_id: Uuid,
    status: u16,
    mut headers: Headers,
    accept_encoding: &str,
    content_type: &str,
    response: reqwest::Response,
) -> Option<u16> {
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!(%request_id, error = %e, "failed to read loopback response body");
            let _ = shared.outbound.send(Frame::Message(ControlMessage::HttpResponse {
                request_id,
                status: 502,
                headers: Headers::new(),
                body: format!("Bad Gateway: {}", e),
            }));
            return Some(502);
        }
    };

    let original_len = body.len() as u64;

    // This side is authoritative for these from here on.
    strip_headers(
        &mut headers,
        &["content-encoding", "content-length", "transfer-encoding"],
    );

    let mut payload = body.to_vec();
    if status != 304 {
        if let Some((encoding, compressed)) =
            compress::compress_body(accept_encoding, content_type, &payload)
        {
            debug!(
                %request_id,
                encoding,
                before = payload.len(),
                after = compressed.len(),
                "compressed response body"
            );
            headers.insert("content-encoding".to_string(), encoding.to_string());
            payload = compressed;
        }
    }
    let compressed = headers.contains_key("content-encoding");
    headers.insert("content-length".to_string(), payload.len().to_string());

    if original_len > INLINE_MAX {
        // Buffered for compression, streamed back out in chunks.
        let total = payload.len() as u64;
        let start = ControlMessage::HttpResponseStreamStart {
            request_id,
            status,
            headers,
            total_size: Some(total),
        };
        if shared.outbound.send(Frame::Message(start)).is_err() {
            return None;
        }
        for chunk in payload.chunks(CHUNK_SIZE) {
            let frame = Frame::WithPayload(
                ControlMessage::HttpResponseStreamChunk {
                    request_id,
                    chunk_size: chunk.len() as u32,
                },
                Bytes::copy_from_slice(chunk),
            );
            if shared.outbound.send(frame).is_err() {
                return None;
            }
        }
        let _ = shared
            .outbound
            .send(Frame::Message(ControlMessage::HttpResponseStreamEnd {
                request_id,
            }));
        return Some(status);
    }

    // A JSON string field cannot carry arbitrary bytes, so anything
    // compressed, large, or non-UTF-8 goes as a binary frame.
    if compressed || payload.len() >= BINARY_MIN {
        send_binary(shared, request_id, status, headers, payload);
        return Some(status);
    }
    match String::from_utf8(payload) {
        Ok(text) => {
            let _ = shared.outbound.send(Frame::Message(ControlMessage::HttpResponse {
                request_id,
                status,
                headers,
                body: text,
            }));
        }
        Err(err) => {
            send_binary(shared, request_id, status, headers, err.into_bytes());
        }
    }
    Some(status)
}

fn send_binary(
    shared: &SessionShared,
    request_id: Uuid,
    status: u16,
    headers: Headers,
    payload: Vec<u8>,
) {
    let frame = Frame::WithPayload(
        ControlMessage::HttpResponseBinary {
            request_id,
            status,
            headers,
            body_size: payload.len() as u64,
        },
        Bytes::from(payload),
    );
    let _ = shared.outbound.send(frame);
}

/// Forward the upstream body chunk-by-chunk as it arrives. Used for SSE
/// (unbounded, `total_size` absent) and for bodies too large to buffer.
async fn stream_response(
    shared: &SessionShared,
    request_id: Uuid,
    status: u16,
    headers: Headers,
    total_size: Option<u64>,
    response: reqwest::Response,
) -> Option<u16> {
    let start = ControlMessage::HttpResponseStreamStart {
        request_id,
        status,
        headers,
        total_size,
    };
    if shared.outbound.send(Frame::Message(start)).is_err() {
        return None;
    }

    let mut body = response.bytes_stream();
    let mut sent: u64 = 0;
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) if chunk.is_empty() => continue,
            Ok(chunk) => {
                sent += chunk.len() as u64;
                let frame = Frame::WithPayload(
                    ControlMessage::HttpResponseStreamChunk {
                        request_id,
                        chunk_size: chunk.len() as u32,
                    },
                    chunk,
                );
                if shared.outbound.send(frame).is_err() {
                    // Control channel gone mid-stream; nothing left to tell.
                    return None;
                }
                shared.events.emit(TunnelEvent::StreamProgress {
                    id: request_id,
                    bytes: sent,
                });
            }
            Err(e) => {
                warn!(%request_id, error = %e, "loopback stream failed");
                let _ = shared
                    .outbound
                    .send(Frame::Message(ControlMessage::HttpResponseStreamError {
                        request_id,
                        error: e.to_string(),
                    }));
                return Some(status);
            }
        }
    }

    let _ = shared
        .outbound
        .send(Frame::Message(ControlMessage::HttpResponseStreamEnd {
            request_id,
        }));
    debug!(%request_id, bytes = sent, "stream complete");
    Some(status)
}

async fn forward_to_loopback(
    shared: &SessionShared,
    method: &str,
    path: &str,
    headers: &Headers,
    body: String,
) -> Result<reqwest::Response, ForwardError> {
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| ForwardError::Method(method.to_string()))?;
    let has_body = method != reqwest::Method::GET && method != reqwest::Method::HEAD;

    let url = format!("http://localhost:{}{}", shared.local_port, path);
    let mut request = shared.http.request(method, &url);
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        // The loopback server gets its own host; the routing header is ours.
        if lower == "host" || lower == "x-tunnel-subdomain" {
            continue;
        }
        if !has_body && (lower == "content-length" || lower == "transfer-encoding") {
            continue;
        }
        // accept-encoding passes through so the app keeps its ETag/Vary
        // behaviour.
        request = request.header(name.as_str(), value.as_str());
    }
    if has_body && !body.is_empty() {
        request = request.body(body);
    }

    Ok(request.send().await?)
}

/// Display-only classification for the event stream.
pub fn classify_request(headers: &Headers, path: &str) -> RequestKind {
    if header_get(headers, "upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return RequestKind::Ws;
    }
    let accept = header_get(headers, "accept").unwrap_or_default();
    if accept.contains("text/event-stream") || is_hmr_path(path) {
        return RequestKind::Sse;
    }
    RequestKind::Http
}

fn is_hmr_path(path: &str) -> bool {
    ["/@vite", "__webpack_hmr", "hot-update", "/__hmr"]
        .iter()
        .any(|hint| path.contains(hint))
}

/// Pick the wire shape from the response envelope alone; the decision has to
/// land before the body is read.
pub fn classify_response(headers: &Headers, content_length: Option<u64>) -> ResponseMode {
    let content_type = header_get(headers, "content-type").unwrap_or_default();
    let unbuffered = header_get(headers, "x-accel-buffering")
        .map(|v| v.eq_ignore_ascii_case("no"))
        .unwrap_or(false);
    if content_type.contains("text/event-stream") || unbuffered {
        return ResponseMode::Sse;
    }
    match content_length {
        Some(len) if len > BUFFER_MAX => ResponseMode::RawStream,
        Some(len) if len > INLINE_MAX => ResponseMode::CompressedStream,
        _ => ResponseMode::Inline,
    }
}

/// Weak-prefix-insensitive ETag comparison.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    fn strip(tag: &str) -> &str {
        let tag = tag.trim();
        tag.strip_prefix("W/").unwrap_or(tag)
    }
    let target = strip(etag);
    if_none_match
        .split(',')
        .map(strip)
        .any(|candidate| candidate == target || candidate == "*")
}

pub(crate) fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn strip_headers(headers: &mut Headers, names: &[&str]) {
    headers.retain(|key, _| !names.iter().any(|name| key.eq_ignore_ascii_case(name)));
}

fn snapshot_headers(headers: &reqwest::header::HeaderMap) -> Headers {
    let mut snapshot = Headers::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            snapshot.insert(name.as_str().to_string(), value.to_string());
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_classify_response_size_boundaries() {
        let plain = headers(&[("content-type", "application/octet-stream")]);

        assert_eq!(
            classify_response(&plain, Some(INLINE_MAX)),
            ResponseMode::Inline
        );
        assert_eq!(
            classify_response(&plain, Some(INLINE_MAX + 1)),
            ResponseMode::CompressedStream
        );
        assert_eq!(
            classify_response(&plain, Some(BUFFER_MAX)),
            ResponseMode::CompressedStream
        );
        assert_eq!(
            classify_response(&plain, Some(BUFFER_MAX + 1)),
            ResponseMode::RawStream
        );
        // No declared length: buffer and decide from what arrives.
        assert_eq!(classify_response(&plain, None), ResponseMode::Inline);
    }

    #[test]
    fn test_sse_beats_size() {
        let sse = headers(&[("content-type", "text/event-stream")]);
        assert_eq!(classify_response(&sse, Some(BUFFER_MAX * 2)), ResponseMode::Sse);
        assert_eq!(classify_response(&sse, None), ResponseMode::Sse);

        let unbuffered = headers(&[
            ("content-type", "text/html"),
            ("x-accel-buffering", "no"),
        ]);
        assert_eq!(classify_response(&unbuffered, Some(10)), ResponseMode::Sse);
    }

    #[test]
    fn test_etag_matching() {
        assert!(etag_matches("\"abc\"", "\"abc\""));
        assert!(etag_matches("\"abc\"", "W/\"abc\""));
        assert!(etag_matches("W/\"abc\"", "\"abc\""));
        assert!(etag_matches("\"x\", \"abc\"", "W/\"abc\""));
        assert!(etag_matches("*", "\"anything\""));
        assert!(!etag_matches("\"abc\"", "\"abd\""));
        assert!(!etag_matches("", "\"abc\""));
    }

    #[test]
    fn test_classify_request() {
        let ws = headers(&[("upgrade", "websocket"), ("connection", "Upgrade")]);
        assert_eq!(classify_request(&ws, "/socket"), RequestKind::Ws);

        let sse = headers(&[("accept", "text/event-stream")]);
        assert_eq!(classify_request(&sse, "/events"), RequestKind::Sse);

        let plain = headers(&[("accept", "text/html")]);
        assert_eq!(classify_request(&plain, "/index.html"), RequestKind::Http);
        assert_eq!(
            classify_request(&plain, "/main.ab12.hot-update.js"),
            RequestKind::Sse
        );
    }

    #[test]
    fn test_header_get_is_case_insensitive() {
        let map = headers(&[("Content-Type", "text/html")]);
        assert_eq!(header_get(&map, "content-type"), Some("text/html"));
        assert_eq!(header_get(&map, "CONTENT-TYPE"), Some("text/html"));
        assert_eq!(header_get(&map, "etag"), None);
    }

    #[test]
    fn test_strip_headers() {
        let mut map = headers(&[
            ("Content-Length", "10"),
            ("content-encoding", "gzip"),
            ("etag", "\"abc\""),
        ]);
        strip_headers(&mut map, &["content-length", "content-encoding"]);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("etag"));
    }
}
