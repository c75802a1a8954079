//! Minimal Minecraft protocol support
//!
//! The relay only ever looks at the first packet of a client connection (the
//! handshake, which names the server the client wants) and, when routing
//! fails, answers with a disconnect before closing. Everything here follows
//! the standard varint-prefixed packet framing; varints are i32 values in
//! 7-bit groups, low group first, at most 5 bytes.

use bytes::Bytes;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Status ping, or server-list request.
pub const NEXT_STATE_STATUS: i32 = 1;
/// Login attempt.
pub const NEXT_STATE_LOGIN: i32 = 2;

/// Upper bound on the first client packet. A real handshake is under 300
/// bytes; anything near this limit is garbage.
pub const MAX_HANDSHAKE_PACKET: usize = 32 * 1024;

/// Longest server-address field the handshake allows.
const MAX_ADDRESS_CHARS: usize = 255;

/// Longest JSON chat string a login disconnect may carry.
const MAX_CHAT_LENGTH: usize = 262_144;

/// Errors from the Minecraft-side codec.
#[derive(Debug, Error)]
pub enum McError {
    #[error("varint is longer than 5 bytes")]
    VarIntTooLong,

    #[error("packet of {0} bytes exceeds the handshake limit")]
    PacketTooLarge(usize),

    #[error("negative length prefix")]
    NegativeLength,

    #[error("string of {got} chars exceeds the {max}-char limit")]
    StringTooLong { got: usize, max: usize },

    #[error("string is not valid UTF-8")]
    InvalidString,

    #[error("packet ended before its declared contents")]
    Truncated,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The fields of a client handshake packet the relay cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

impl Handshake {
    /// Parse a handshake packet body (the bytes after the varint length
    /// prefix): packet id, protocol version, server address, port, next
    /// state.
    pub fn parse(body: &[u8]) -> Result<Handshake, McError> {
        let mut reader = SliceReader::new(body);
        let _packet_id = reader.read_varint()?;
        let protocol_version = reader.read_varint()?;
        let server_address = reader.read_string(MAX_ADDRESS_CHARS)?;
        let server_port = reader.read_u16()?;
        let next_state = reader.read_varint()?;
        Ok(Handshake {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }
}

/// Read one varint-length-prefixed packet body from the socket.
pub async fn read_packet<R>(reader: &mut R) -> Result<Bytes, McError>
where
    R: AsyncRead + Unpin,
{
    let len = read_varint(reader).await?;
    if len < 0 {
        return Err(McError::NegativeLength);
    }
    let len = len as usize;
    if len > MAX_HANDSHAKE_PACKET {
        return Err(McError::PacketTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            McError::Truncated
        } else {
            McError::Io(e)
        }
    })?;
    Ok(Bytes::from(body))
}

/// Read a varint from the socket, one byte at a time.
pub async fn read_varint<R>(reader: &mut R) -> Result<i32, McError>
where
    R: AsyncRead + Unpin,
{
    let mut value: u32 = 0;
    for shift in 0..5 {
        let byte = reader.read_u8().await?;
        value |= u32::from(byte & 0x7f) << (shift * 7);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(McError::VarIntTooLong)
}

/// Append a varint to a buffer.
pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut rest = value as u32;
    loop {
        let mut byte = (rest & 0x7f) as u8;
        rest >>= 7;
        if rest != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if rest == 0 {
            break;
        }
    }
}

/// Append a varint-length-prefixed UTF-8 string to a buffer.
pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

/// Restore the varint length prefix in front of a packet body, yielding the
/// exact bytes the client originally sent.
pub fn frame_packet(body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(body.len() + 5);
    write_varint(&mut packet, body.len() as i32);
    packet.extend_from_slice(body);
    packet
}

/// Send a red disconnect message framed for the given next-state, then close
/// the write side. Status pings additionally expect a pong packet before the
/// connection drops.
pub async fn send_disconnect<W>(
    writer: &mut W,
    next_state: i32,
    message: &str,
) -> Result<(), McError>
where
    W: AsyncWrite + Unpin,
{
    let chat = json!({ "text": message, "color": "red" }).to_string();

    let mut body = Vec::new();
    write_varint(&mut body, 0x00);
    match next_state {
        NEXT_STATE_STATUS => {
            let status = json!({ "description": { "text": message, "color": "red" } });
            write_string(&mut body, &status.to_string());
        }
        NEXT_STATE_LOGIN => {
            if chat.len() > MAX_CHAT_LENGTH {
                return Err(McError::StringTooLong {
                    got: chat.len(),
                    max: MAX_CHAT_LENGTH,
                });
            }
            write_string(&mut body, &chat);
        }
        _ => {}
    }
    writer.write_all(&frame_packet(&body)).await?;
    writer.flush().await?;

    if next_state == NEXT_STATE_STATUS {
        let mut pong = Vec::new();
        write_varint(&mut pong, 0x01);
        pong.extend_from_slice(&[0u8; 8]);
        writer.write_all(&frame_packet(&pong)).await?;
        writer.flush().await?;
    }

    writer.shutdown().await?;
    Ok(())
}

/// Cursor over an already-read packet body.
struct SliceReader<'a> {
    buf: &'a [u8],
}

impl<'a> SliceReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        SliceReader { buf }
    }

    fn read_u8(&mut self) -> Result<u8, McError> {
        let (&byte, rest) = self.buf.split_first().ok_or(McError::Truncated)?;
        self.buf = rest;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, McError> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn read_varint(&mut self) -> Result<i32, McError> {
        let mut value: u32 = 0;
        for shift in 0..5 {
            let byte = self.read_u8()?;
            value |= u32::from(byte & 0x7f) << (shift * 7);
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(McError::VarIntTooLong)
    }

    fn read_string(&mut self, max_chars: usize) -> Result<String, McError> {
        let len = self.read_varint()?;
        if len < 0 {
            return Err(McError::NegativeLength);
        }
        let len = len as usize;
        if len > max_chars * 4 {
            return Err(McError::StringTooLong {
                got: len,
                max: max_chars * 4,
            });
        }
        if self.buf.len() < len {
            return Err(McError::Truncated);
        }
        let (raw, rest) = self.buf.split_at(len);
        self.buf = rest;
        let s = std::str::from_utf8(raw).map_err(|_| McError::InvalidString)?;
        if s.chars().count() > max_chars {
            return Err(McError::StringTooLong {
                got: s.chars().count(),
                max: max_chars,
            });
        }
        Ok(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(value: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        buf
    }

    #[test]
    fn test_varint_vectors() {
        assert_eq!(varint_bytes(0), [0x00]);
        assert_eq!(varint_bytes(1), [0x01]);
        assert_eq!(varint_bytes(127), [0x7f]);
        assert_eq!(varint_bytes(128), [0x80, 0x01]);
        assert_eq!(varint_bytes(255), [0xff, 0x01]);
        assert_eq!(varint_bytes(25565), [0xdd, 0xc7, 0x01]);
        assert_eq!(varint_bytes(i32::MAX), [0xff, 0xff, 0xff, 0xff, 0x07]);
        assert_eq!(varint_bytes(-1), [0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[tokio::test]
    async fn test_varint_round_trip() {
        for value in [0, 1, 127, 128, 300, 25565, i32::MAX, -1, i32::MIN] {
            let buf = varint_bytes(value);
            let decoded = read_varint(&mut buf.as_slice()).await.unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[tokio::test]
    async fn test_varint_too_long() {
        let buf = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01];
        let err = read_varint(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, McError::VarIntTooLong));
    }

    fn sample_handshake_body(address: &str, next_state: i32) -> Vec<u8> {
        let mut body = Vec::new();
        write_varint(&mut body, 0x00); // packet id
        write_varint(&mut body, 763); // protocol version
        write_string(&mut body, address);
        body.extend_from_slice(&25565u16.to_be_bytes());
        write_varint(&mut body, next_state);
        body
    }

    #[test]
    fn test_handshake_parse() {
        let body = sample_handshake_body("42.example.com", NEXT_STATE_LOGIN);
        let hs = Handshake::parse(&body).unwrap();
        assert_eq!(hs.protocol_version, 763);
        assert_eq!(hs.server_address, "42.example.com");
        assert_eq!(hs.server_port, 25565);
        assert_eq!(hs.next_state, NEXT_STATE_LOGIN);
    }

    #[test]
    fn test_handshake_truncated() {
        let body = sample_handshake_body("abc.example.com", NEXT_STATE_STATUS);
        let err = Handshake::parse(&body[..body.len() - 4]).unwrap_err();
        assert!(matches!(err, McError::Truncated));
    }

    #[test]
    fn test_handshake_address_too_long() {
        let body = sample_handshake_body(&"x".repeat(256), NEXT_STATE_LOGIN);
        let err = Handshake::parse(&body).unwrap_err();
        assert!(matches!(err, McError::StringTooLong { .. }));
    }

    #[tokio::test]
    async fn test_read_packet_round_trip() {
        let body = sample_handshake_body("7.example.com", NEXT_STATE_STATUS);
        let framed = frame_packet(&body);
        let read = read_packet(&mut framed.as_slice()).await.unwrap();
        assert_eq!(&read[..], &body[..]);
    }

    #[tokio::test]
    async fn test_read_packet_rejects_oversized() {
        let mut framed = Vec::new();
        write_varint(&mut framed, (MAX_HANDSHAKE_PACKET + 1) as i32);
        let err = read_packet(&mut framed.as_slice()).await.unwrap_err();
        assert!(matches!(err, McError::PacketTooLarge(_)));
    }

    #[tokio::test]
    async fn test_login_disconnect_framing() {
        let mut out = Vec::new();
        send_disconnect(&mut out, NEXT_STATE_LOGIN, "nope").await.unwrap();

        let body = read_packet(&mut out.as_slice()).await.unwrap();
        let mut reader = SliceReader::new(&body);
        assert_eq!(reader.read_varint().unwrap(), 0x00);
        let chat = reader.read_string(MAX_CHAT_LENGTH).unwrap();
        assert_eq!(chat, r#"{"color":"red","text":"nope"}"#);
        assert!(reader.buf.is_empty());
    }

    #[tokio::test]
    async fn test_status_disconnect_includes_pong() {
        let mut out = Vec::new();
        send_disconnect(&mut out, NEXT_STATE_STATUS, "nope").await.unwrap();

        let mut cursor = out.as_slice();
        let status_body = read_packet(&mut cursor).await.unwrap();
        let mut reader = SliceReader::new(&status_body);
        assert_eq!(reader.read_varint().unwrap(), 0x00);
        let payload = reader.read_string(MAX_CHAT_LENGTH).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["description"]["text"], "nope");
        assert_eq!(parsed["description"]["color"], "red");

        let pong_body = read_packet(&mut cursor).await.unwrap();
        assert_eq!(pong_body[0], 0x01);
        assert_eq!(&pong_body[1..], &[0u8; 8]);
        assert!(cursor.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_escapes_message() {
        let mut out = Vec::new();
        send_disconnect(&mut out, NEXT_STATE_LOGIN, "a \"quoted\" reason")
            .await
            .unwrap();

        let body = read_packet(&mut out.as_slice()).await.unwrap();
        let mut reader = SliceReader::new(&body);
        reader.read_varint().unwrap();
        let chat = reader.read_string(MAX_CHAT_LENGTH).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&chat).unwrap();
        assert_eq!(parsed["text"], "a \"quoted\" reason");
    }
}
