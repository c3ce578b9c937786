//! LSP message framing layer
//!
//! Handles LSP-specific message framing using Content-Length headers
//! as specified in the Language Server Protocol base protocol.
//!
//! LSP message framing format:
//! Content-Length: <length>\r\n\r\n<content>
//!
//! The framing is expressed as a `tokio_util` codec so it can sit directly
//! on top of any `AsyncRead`/`AsyncWrite` pair via `FramedRead`/`FramedWrite`.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Maximum message size to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB

/// Maximum size of the header block before the blank line
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Error types for LSP framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid LSP header: {0}")]
    InvalidHeader(String),

    #[error("Missing Content-Length header")]
    MissingContentLength,

    #[error("Invalid content length: {0}")]
    InvalidContentLength(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Header block exceeds {max} bytes without terminator")]
    HeaderTooLarge { max: usize },

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Stream ended inside a frame ({buffered} bytes buffered)")]
    UnexpectedEof { buffered: usize },
}

/// Codec for `Content-Length` framed LSP messages
///
/// Decodes into the raw UTF-8 body; JSON parsing happens one layer up.
#[derive(Debug, Default)]
pub struct LspCodec {
    /// Body length of the frame whose header has already been consumed
    pending_length: Option<usize>,
}

impl LspCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the header block (without the terminating blank line)
    fn parse_content_length(header: &[u8]) -> Result<usize, FramingError> {
        let header = std::str::from_utf8(header)
            .map_err(|_| FramingError::InvalidHeader("header is not ASCII".to_string()))?;

        let mut content_length = None;
        for line in header.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FramingError::InvalidHeader(line.to_string()))?;

            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                let length = value
                    .parse::<usize>()
                    .map_err(|_| FramingError::InvalidContentLength(value.to_string()))?;
                content_length = Some(length);
            }
            // Content-Type and any other header is accepted and ignored
        }

        let length = content_length.ok_or(FramingError::MissingContentLength)?;
        if length > MAX_MESSAGE_SIZE {
            return Err(FramingError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        Ok(length)
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

impl Decoder for LspCodec {
    type Item = String;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.pending_length {
            Some(length) => length,
            None => {
                let Some(header_end) = find_terminator(src) else {
                    if src.len() > MAX_HEADER_SIZE {
                        return Err(FramingError::HeaderTooLarge {
                            max: MAX_HEADER_SIZE,
                        });
                    }
                    return Ok(None);
                };
                if header_end > MAX_HEADER_SIZE {
                    return Err(FramingError::HeaderTooLarge {
                        max: MAX_HEADER_SIZE,
                    });
                }

                let length = Self::parse_content_length(&src[..header_end])?;
                src.advance(header_end + HEADER_TERMINATOR.len());
                self.pending_length = Some(length);
                length
            }
        };

        if src.len() < length {
            trace!(
                "LspCodec: Incomplete message - need {} more bytes",
                length - src.len()
            );
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.pending_length = None;
        let body = src.split_to(length);
        let message = String::from_utf8(body.to_vec()).map_err(|_| FramingError::InvalidUtf8)?;

        trace!("LspCodec: Parsed complete message ({} bytes)", length);
        Ok(Some(message))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(buf)? {
            return Ok(Some(message));
        }

        if self.pending_length.is_none() && buf.iter().all(u8::is_ascii_whitespace) {
            buf.clear();
            return Ok(None);
        }

        Err(FramingError::UnexpectedEof {
            buffered: buf.len(),
        })
    }
}

impl Encoder<String> for LspCodec {
    type Error = FramingError;

    fn encode(&mut self, message: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = format!("Content-Length: {}\r\n\r\n", message.len());

        trace!(
            "LspCodec: Encoding framed message ({} bytes content)",
            message.len()
        );

        dst.reserve(header.len() + message.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(message.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn frame(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
    }

    #[test]
    fn test_encode_adds_content_length_header() {
        let message = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;
        let mut codec = LspCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(message.to_string(), &mut buf).unwrap();

        assert_eq!(&buf[..], frame(message).as_bytes());
    }

    #[test]
    fn test_content_length_counts_bytes_not_chars() {
        let message = r#"{"text":"héllo ✓"}"#;
        let mut codec = LspCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(message.to_string(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap();

        assert_eq!(decoded.as_deref(), Some(message));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_message_waits_for_body() {
        let message = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let header = format!("Content-Length: {}\r\n\r\n", message.len());
        let mut codec = LspCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(header[..10].as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(header[10..].as_bytes());
        buf.extend_from_slice(message[..10].as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(message[10..].as_bytes());
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some(message));
    }

    #[test]
    fn test_extra_headers_are_ignored() {
        let message = r#"{"jsonrpc":"2.0","method":"initialized"}"#;
        let raw = format!(
            "content-length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            message.len(),
            message
        );
        let mut buf = BytesMut::from(raw.as_bytes());

        let decoded = LspCodec::new().decode(&mut buf).unwrap();
        assert_eq!(decoded.as_deref(), Some(message));
    }

    #[tokio::test]
    async fn test_multiple_messages_in_one_read() {
        let message1 = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;
        let message2 = r#"{"jsonrpc":"2.0","id":2,"method":"shutdown"}"#;
        let combined = format!("{}{}", frame(message1), frame(message2));

        let mut reader = FramedRead::new(combined.as_bytes(), LspCodec::new());

        assert_eq!(reader.next().await.unwrap().unwrap(), message1);
        assert_eq!(reader.next().await.unwrap().unwrap(), message2);
        assert!(reader.next().await.is_none());
    }

    #[test]
    fn test_invalid_content_length() {
        let mut buf = BytesMut::from("Content-Length: invalid\r\n\r\n{}");

        match LspCodec::new().decode(&mut buf) {
            Err(FramingError::InvalidContentLength(value)) => assert_eq!(value, "invalid"),
            other => panic!("Expected InvalidContentLength error, got: {other:?}"),
        }
    }

    #[test]
    fn test_missing_content_length() {
        let mut buf = BytesMut::from("Content-Type: text/plain\r\n\r\n{}");

        assert!(matches!(
            LspCodec::new().decode(&mut buf),
            Err(FramingError::MissingContentLength)
        ));
    }

    #[test]
    fn test_message_too_large() {
        let large_size = MAX_MESSAGE_SIZE + 1;
        let mut buf = BytesMut::from(format!("Content-Length: {large_size}\r\n\r\n").as_bytes());

        match LspCodec::new().decode(&mut buf) {
            Err(FramingError::MessageTooLarge { size, max }) => {
                assert_eq!(size, large_size);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("Expected MessageTooLarge error, got: {other:?}"),
        }
    }

    #[test]
    fn test_header_without_terminator_is_bounded() {
        let mut buf = BytesMut::from(vec![b'x'; MAX_HEADER_SIZE + 1].as_slice());

        assert!(matches!(
            LspCodec::new().decode(&mut buf),
            Err(FramingError::HeaderTooLarge { .. })
        ));
    }

    #[test]
    fn test_complete_oversized_header_is_rejected() {
        let padding = "X-Padding: ".to_string() + &"x".repeat(MAX_HEADER_SIZE);
        let raw = format!("Content-Length: 2\r\n{padding}\r\n\r\n{{}}");
        let mut buf = BytesMut::from(raw.as_bytes());

        assert!(matches!(
            LspCodec::new().decode(&mut buf),
            Err(FramingError::HeaderTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_at_eof() {
        let raw = "Content-Length: 20\r\n\r\n{\"jsonrpc\"";
        let mut reader = FramedRead::new(raw.as_bytes(), LspCodec::new());

        match reader.next().await {
            Some(Err(FramingError::UnexpectedEof { buffered })) => assert_eq!(buffered, 10),
            other => panic!("Expected UnexpectedEof, got: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_utf8_body() {
        let mut raw = b"Content-Length: 2\r\n\r\n".to_vec();
        raw.extend_from_slice(&[0xff, 0xfe]);
        let mut buf = BytesMut::from(raw.as_slice());

        assert!(matches!(
            LspCodec::new().decode(&mut buf),
            Err(FramingError::InvalidUtf8)
        ));
    }
}
