// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Hand-rolled RFC 6455 WebSocket framing.
//!
//! Kept separate from any HTTP framework upgrade helper: the testable
//! properties in this system operate at the byte level (masked vs unmasked
//! frames, the three payload-length encodings, the handshake digest), so the
//! framing is implemented directly over the accepted TCP stream rather than
//! delegated to a convenience layer.

use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// Compute `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// What a single inbound frame resolved to.
#[derive(Debug, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Ping(Vec<u8>),
    Close,
    /// A frame this server has no use for (binary, pong, continuation) —
    /// read off the wire and discarded, not an error.
    Ignored,
}

#[derive(Debug)]
pub enum FrameError {
    Io(std::io::Error),
    /// The frame was malformed or violated a server-only invariant
    /// (fragmented, unmasked, non-UTF-8 text). Already fully consumed from
    /// the stream; the caller should drop just this frame, not the socket.
    Protocol(&'static str),
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Read exactly one frame from `stream`. Returns `Err(FrameError::Io)` only
/// for transport-level failure (the caller should drop the client); every
/// other malformed-frame case is `Protocol` and still leaves the stream
/// aligned for the next frame.
pub async fn read_frame<S>(stream: &mut S) -> Result<InboundFrame, FrameError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    let fin = header[0] & 0x80 != 0;
    let opcode = header[0] & 0x0F;
    let masked = header[1] & 0x80 != 0;
    let len7 = header[1] & 0x7F;

    let payload_len: u64 = match len7 {
        126 => {
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).await?;
            u16::from_be_bytes(buf) as u64
        }
        127 => {
            let mut buf = [0u8; 8];
            stream.read_exact(&mut buf).await?;
            u64::from_be_bytes(buf)
        }
        n => n as u64,
    };

    let mask_key = if masked {
        let mut key = [0u8; 4];
        stream.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; payload_len as usize];
    stream.read_exact(&mut payload).await?;

    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    if !fin {
        return Err(FrameError::Protocol("fragmented frames are not supported"));
    }
    if mask_key.is_none() && opcode != OP_CLOSE {
        return Err(FrameError::Protocol("client frame must be masked"));
    }

    match opcode {
        OP_TEXT => match String::from_utf8(payload) {
            Ok(text) => Ok(InboundFrame::Text(text)),
            Err(_) => Err(FrameError::Protocol("text frame was not valid UTF-8")),
        },
        OP_PING => Ok(InboundFrame::Ping(payload)),
        OP_CLOSE => Ok(InboundFrame::Close),
        OP_BINARY | OP_PONG | OP_CONTINUATION => Ok(InboundFrame::Ignored),
        _ => Err(FrameError::Protocol("unsupported opcode")),
    }
}

fn encode_header(opcode: u8, len: usize) -> Vec<u8> {
    let mut header = vec![0x80 | opcode];
    if len < 126 {
        header.push(len as u8);
    } else if len <= u16::MAX as usize {
        header.push(126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }
    header
}

/// Write an unfragmented, unmasked server text frame.
pub async fn write_text_frame<S>(stream: &mut S, text: &str) -> std::io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let payload = text.as_bytes();
    let mut frame = encode_header(OP_TEXT, payload.len());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    stream.flush().await
}

pub async fn write_pong<S>(stream: &mut S, payload: &[u8]) -> std::io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let mut frame = encode_header(OP_PONG, payload.len());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    stream.flush().await
}

pub async fn write_close<S>(stream: &mut S) -> std::io::Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let frame = encode_header(OP_CLOSE, 0);
    stream.write_all(&frame).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn accept_key_matches_rfc6455_worked_example() {
        // The example key/accept pair from RFC 6455 §1.3.
        let accept = accept_key("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    fn masked_text_frame(text: &str, mask: [u8; 4]) -> Vec<u8> {
        let payload: Vec<u8> = text
            .bytes()
            .enumerate()
            .map(|(i, b)| b ^ mask[i % 4])
            .collect();
        let mut frame = vec![0x80 | OP_TEXT, 0x80 | (payload.len() as u8)];
        frame.extend_from_slice(&mask);
        frame.extend_from_slice(&payload);
        frame
    }

    #[tokio::test]
    async fn read_frame_decodes_masked_short_text() {
        let bytes = masked_text_frame("hi", [0x11, 0x22, 0x33, 0x44]);
        let mut cursor = Cursor::new(bytes);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame, InboundFrame::Text("hi".to_string()));
    }

    #[tokio::test]
    async fn read_frame_decodes_16_bit_length() {
        let text = "x".repeat(200);
        let mask = [1, 2, 3, 4];
        let payload: Vec<u8> = text.bytes().enumerate().map(|(i, b)| b ^ mask[i % 4]).collect();
        let mut frame = vec![0x80 | OP_TEXT, 0x80 | 126];
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&mask);
        frame.extend_from_slice(&payload);

        let mut cursor = Cursor::new(frame);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, InboundFrame::Text(text));
    }

    #[tokio::test]
    async fn read_frame_rejects_unmasked_client_frame() {
        let mut frame = vec![0x80 | OP_TEXT, 2];
        frame.extend_from_slice(b"hi");
        let mut cursor = Cursor::new(frame);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::Protocol(_)));
    }

    #[tokio::test]
    async fn read_frame_rejects_fragmented_frame() {
        let mut frame = vec![OP_TEXT, 0x80 | 2]; // fin bit unset
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.extend_from_slice(b"hi");
        let mut cursor = Cursor::new(frame);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::Protocol(_)));
    }

    #[tokio::test]
    async fn read_frame_rejects_non_utf8_text() {
        let mask = [0, 0, 0, 0];
        let mut frame = vec![0x80 | OP_TEXT, 0x80 | 1];
        frame.extend_from_slice(&mask);
        frame.push(0xFF);
        let mut cursor = Cursor::new(frame);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::Protocol(_)));
    }

    #[tokio::test]
    async fn read_frame_close_opcode() {
        let frame = vec![0x80 | OP_CLOSE, 0x80, 0, 0, 0, 0];
        let mut cursor = Cursor::new(frame);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), InboundFrame::Close);
    }

    async fn written_bytes(n: usize, write: impl FnOnce(&mut tokio::io::DuplexStream) -> futures::future::BoxFuture<'_, std::io::Result<()>>) -> Vec<u8> {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write(&mut a).await.unwrap();
        let mut buf = vec![0u8; n];
        b.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn write_text_frame_is_unmasked_and_roundtrips_through_read_frame_style_decode() {
        let buf = written_bytes(7, |s| Box::pin(write_text_frame(s, "hello"))).await;
        assert_eq!(buf[0], 0x80 | OP_TEXT);
        assert_eq!(buf[1] & 0x80, 0, "server frames must not set the mask bit");
        assert_eq!(buf[1] & 0x7F, 5);
        assert_eq!(&buf[2..], b"hello");
    }

    #[tokio::test]
    async fn write_text_frame_uses_16_bit_length_encoding_over_125_bytes() {
        let text = "a".repeat(200);
        let buf = written_bytes(4 + 200, |s| Box::pin(write_text_frame(s, &text))).await;
        assert_eq!(buf[1], 126);
        let len = u16::from_be_bytes([buf[2], buf[3]]);
        assert_eq!(len as usize, 200);
    }

    #[tokio::test]
    async fn write_pong_echoes_payload() {
        let buf = written_bytes(2 + 9, |s| Box::pin(write_pong(s, b"ping-data"))).await;
        assert_eq!(buf[0], 0x80 | OP_PONG);
        assert_eq!(&buf[2..], b"ping-data");
    }
}
