use std::borrow::Cow;
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};

use crate::utils::error::WebSocketError;

/// Frame-level message type, mirroring the WebSocket opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

/// Errors raised while converting or (de)compressing messages.
#[derive(Error, Debug)]
pub enum MessageError {
    /// Error when the message format is invalid.
    #[error("Invalid message format")]
    InvalidFormat,

    /// A text message carried bytes that are not UTF-8.
    #[error("Text payload is not valid UTF-8")]
    InvalidUtf8,

    /// Error when compression fails.
    #[error("Compression error: {0}")]
    CompressionError(String),

    /// Error when decompression fails.
    #[error("Decompression error: {0}")]
    DecompressionError(String),

    /// A compressed payload inflated past the configured limit.
    #[error("Decompressed payload exceeds {0} bytes")]
    Inflated(usize),
}

/// A single application-level message.
///
/// Messages are immutable once built; the payload is shared, so cloning a message
/// for every recipient of a broadcast does not copy the bytes.
#[derive(Debug, Clone)]
pub struct Message {
    kind: MessageType,
    payload: Arc<[u8]>,
    timestamp: DateTime<Utc>,
    client_id: Option<String>,
    room: Option<String>,
}

impl Message {
    pub fn new(kind: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: Arc::from(payload.into()),
            timestamp: Utc::now(),
            client_id: None,
            room: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageType::Text, text.into().into_bytes())
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageType::Binary, data)
    }

    /// Serializes `value` into a text message.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, WebSocketError> {
        Ok(Self::text(serde_json::to_string(value)?))
    }

    /// Close message carrying `code` and `reason` in RFC 6455 layout.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = u16::from(code).to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        Self::new(MessageType::Close, payload)
    }

    /// Tags the message with the id of the client it originated from.
    pub fn with_origin(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Tags the message with the room it was broadcast to.
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as UTF-8, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Converts into a protocol frame. Binary payloads are deflated when `compress` is set.
    pub fn to_frame(&self, compress: bool) -> Result<tungstenite::Message, MessageError> {
        Ok(match self.kind {
            MessageType::Text => tungstenite::Message::Text(
                String::from_utf8(self.payload.to_vec()).map_err(|_| MessageError::InvalidUtf8)?,
            ),
            MessageType::Binary if compress => {
                tungstenite::Message::Binary(compress_message(&self.payload)?)
            }
            MessageType::Binary => tungstenite::Message::Binary(self.payload.to_vec()),
            MessageType::Ping => tungstenite::Message::Ping(self.payload.to_vec()),
            MessageType::Pong => tungstenite::Message::Pong(self.payload.to_vec()),
            MessageType::Close => tungstenite::Message::Close(close_frame(&self.payload)),
        })
    }

    /// Builds a message from a received frame. Raw frames yield `None`.
    pub fn from_frame(
        frame: tungstenite::Message,
        decompress: bool,
        max_size: usize,
    ) -> Result<Option<Self>, MessageError> {
        Ok(Some(match frame {
            tungstenite::Message::Text(text) => Self::text(text),
            tungstenite::Message::Binary(data) if decompress => {
                Self::binary(decompress_message(&data, max_size)?)
            }
            tungstenite::Message::Binary(data) => Self::binary(data),
            tungstenite::Message::Ping(data) => Self::new(MessageType::Ping, data),
            tungstenite::Message::Pong(data) => Self::new(MessageType::Pong, data),
            tungstenite::Message::Close(Some(frame)) => Self::close(frame.code, &frame.reason),
            tungstenite::Message::Close(None) => Self::new(MessageType::Close, Vec::new()),
            tungstenite::Message::Frame(_) => return Ok(None),
        }))
    }
}

fn close_frame(payload: &[u8]) -> Option<CloseFrame<'static>> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    Some(CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(String::from_utf8_lossy(&payload[2..]).into_owned()),
    })
}

/// Compresses a byte slice with raw deflate at the default level.
pub fn compress_message(data: &[u8]) -> Result<Vec<u8>, MessageError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| MessageError::CompressionError(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| MessageError::CompressionError(e.to_string()))
}

/// Inflates a raw deflate stream produced by [`compress_message`], stopping
/// once the output would exceed `max_size` bytes. `0` means unlimited.
pub fn decompress_message(data: &[u8], max_size: usize) -> Result<Vec<u8>, MessageError> {
    let mut decoder = DeflateDecoder::new(data);
    let mut output = Vec::with_capacity(data.len().saturating_mul(2));
    let read = if max_size > 0 {
        decoder.take(max_size as u64 + 1).read_to_end(&mut output)
    } else {
        decoder.read_to_end(&mut output)
    };
    read.map_err(|e| MessageError::DecompressionError(e.to_string()))?;
    if max_size > 0 && output.len() > max_size {
        return Err(MessageError::Inflated(max_size));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frame_keeps_content() {
        let msg = Message::text("hello").with_origin("c1").with_room("lobby");
        assert_eq!(msg.kind(), MessageType::Text);
        assert_eq!(msg.as_text(), Some("hello"));
        assert_eq!(msg.client_id(), Some("c1"));
        assert_eq!(msg.room(), Some("lobby"));
        assert_eq!(
            msg.to_frame(false).unwrap(),
            tungstenite::Message::Text("hello".into())
        );
    }

    #[test]
    fn compressed_binary_inflates_on_read() {
        let data = vec![7u8; 4096];
        let frame = Message::binary(data.clone()).to_frame(true).unwrap();
        match &frame {
            tungstenite::Message::Binary(bytes) => assert!(bytes.len() < data.len()),
            other => panic!("unexpected frame {other:?}"),
        }
        let decoded = Message::from_frame(frame, true, 0).unwrap().unwrap();
        assert_eq!(decoded.payload(), data.as_slice());
    }

    #[test]
    fn decompressing_garbage_fails() {
        assert!(decompress_message(&[0xff, 0x00, 0x13, 0x37], 0).is_err());
    }

    #[test]
    fn inflating_past_the_limit_fails() {
        let bomb = compress_message(&vec![0u8; 1 << 20]).unwrap();
        assert!(bomb.len() < 4096);
        assert!(matches!(
            decompress_message(&bomb, 64 * 1024),
            Err(MessageError::Inflated(limit)) if limit == 64 * 1024
        ));
        assert!(matches!(
            Message::from_frame(tungstenite::Message::Binary(bomb.clone()), true, 1024),
            Err(MessageError::Inflated(1024))
        ));
        assert_eq!(decompress_message(&bomb, 1 << 20).unwrap().len(), 1 << 20);
    }

    #[test]
    fn close_frame_carries_code_and_reason() {
        let frame = Message::close(CloseCode::Normal, "bye").to_frame(false).unwrap();
        match frame {
            tungstenite::Message::Close(Some(cf)) => {
                assert_eq!(cf.code, CloseCode::Normal);
                assert_eq!(cf.reason, "bye");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn non_utf8_text_is_rejected() {
        let msg = Message::new(MessageType::Text, vec![0xc3, 0x28]);
        assert!(matches!(msg.to_frame(false), Err(MessageError::InvalidUtf8)));
    }

    #[test]
    fn json_helper_serializes() {
        let msg = Message::json(&serde_json::json!({"k": 1})).unwrap();
        assert_eq!(msg.as_text(), Some(r#"{"k":1}"#));
    }
}
