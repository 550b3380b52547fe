//! Frame encoding and decoding
//!
//! A [`Frame`] is one outbound unit: a control message, optionally paired
//! with the binary payload it announces. Keeping the pair in a single value
//! lets both ends push it through one writer queue so nothing can interleave
//! between a `*_binary`/`*_chunk` header and its raw frame.

use bytes::Bytes;
use thiserror::Error;

use crate::messages::{ControlMessage, KNOWN_TYPES};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed control frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("control frame is not a JSON object with a string `type`")]
    MissingType,

    #[error("`{0}` does not announce a binary payload")]
    UnexpectedPayload(&'static str),

    #[error("`{0}` announces a binary payload but none was provided")]
    MissingPayload(&'static str),
}

/// One outbound unit on a control connection.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A bare control message.
    Message(ControlMessage),
    /// A control message followed by the binary payload it announces.
    WithPayload(ControlMessage, Bytes),
}

impl Frame {
    /// Encode to the text frame and the optional binary frame that follows
    /// it. Fails if the message and payload disagree about announcement.
    pub fn encode(&self) -> Result<(String, Option<Bytes>), CodecError> {
        match self {
            Frame::Message(msg) => {
                if msg.announces_binary() {
                    return Err(CodecError::MissingPayload(msg.type_name()));
                }
                Ok((serde_json::to_string(msg)?, None))
            }
            Frame::WithPayload(msg, payload) => {
                if !msg.announces_binary() {
                    return Err(CodecError::UnexpectedPayload(msg.type_name()));
                }
                Ok((serde_json::to_string(msg)?, Some(payload.clone())))
            }
        }
    }

    pub fn message(&self) -> &ControlMessage {
        match self {
            Frame::Message(msg) | Frame::WithPayload(msg, _) => msg,
        }
    }
}

/// Decode one text frame.
///
/// Returns `Ok(None)` for a well-formed object whose `type` this protocol
/// version does not know: unknown types are ignored so that newer peers can
/// speak to older ones. Malformed JSON is an error; the caller logs and drops
/// the frame without closing the channel.
pub fn decode_text(text: &str) -> Result<Option<ControlMessage>, CodecError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let type_name = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(CodecError::MissingType)?;
    if !KNOWN_TYPES.contains(&type_name) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Headers;
    use uuid::Uuid;

    #[test]
    fn test_encode_bare_message() {
        let frame = Frame::Message(ControlMessage::Pong);
        let (text, payload) = frame.encode().unwrap();
        assert_eq!(text, r#"{"type":"pong"}"#);
        assert!(payload.is_none());
    }

    #[test]
    fn test_encode_with_payload() {
        let frame = Frame::WithPayload(
            ControlMessage::HttpResponseStreamChunk {
                request_id: Uuid::new_v4(),
                chunk_size: 3,
            },
            Bytes::from_static(b"abc"),
        );
        let (text, payload) = frame.encode().unwrap();
        assert!(text.contains("http_response_stream_chunk"));
        assert_eq!(payload.unwrap(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_encode_rejects_mismatched_pairing() {
        let announcing = Frame::Message(ControlMessage::WsMessageBinary {
            ws_id: Uuid::new_v4(),
        });
        assert!(matches!(
            announcing.encode(),
            Err(CodecError::MissingPayload("ws_message_binary"))
        ));

        let silent = Frame::WithPayload(ControlMessage::Pong, Bytes::from_static(b"x"));
        assert!(matches!(
            silent.encode(),
            Err(CodecError::UnexpectedPayload("pong"))
        ));
    }

    #[test]
    fn test_decode_roundtrip() {
        let msg = ControlMessage::HttpResponse {
            request_id: Uuid::new_v4(),
            status: 404,
            headers: Headers::new(),
            body: "Not Found".to_string(),
        };
        let (text, _) = Frame::Message(msg.clone()).encode().unwrap();
        assert_eq!(decode_text(&text).unwrap(), Some(msg));
    }

    #[test]
    fn test_decode_unknown_type_is_ignored() {
        let decoded = decode_text(r#"{"type":"future_feature","x":1}"#).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_decode_malformed() {
        assert!(decode_text("not json").is_err());
        assert!(matches!(
            decode_text(r#"{"no_type":true}"#),
            Err(CodecError::MissingType)
        ));
        assert!(matches!(decode_text(r#"[1,2,3]"#), Err(CodecError::MissingType)));
        // Known type but wrong fields is malformed, not unknown.
        assert!(decode_text(r#"{"type":"http_response"}"#).is_err());
    }
}
