//! Management-link frame codec
//!
//! Every unit on a management link after the handshake is one frame:
//!
//! ```text
//! [8-byte stream id BE][1-byte kind][kind payload]
//! ```
//!
//! | kind | payload                              | meaning                    |
//! |------|--------------------------------------|----------------------------|
//! | 0    | 1-byte address length + raw IP octets| Open: new proxied stream   |
//! | 1    | 2-byte length BE + up to 65535 bytes | Packet: raw stream data    |
//! | 2    | (empty)                              | Close: stream has ended    |
//!
//! There is no outer length prefix; each decode consumes exactly one frame
//! and the next read starts the next frame. Open frames only ever travel
//! relay -> backend, so the decoder (which only runs on the relay) treats an
//! incoming Open as a protocol violation.

use bytes::Bytes;
use std::net::IpAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_PACKET_PAYLOAD;

const KIND_OPEN: u8 = 0;
const KIND_PACKET: u8 = 1;
const KIND_CLOSE: u8 = 2;

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("frame truncated before its declared end")]
    Truncated,

    #[error("received an Open frame from a backend")]
    ProtocolViolation,

    #[error("packet payload of {0} bytes exceeds the {MAX_PACKET_PAYLOAD}-byte limit")]
    PayloadTooLarge(usize),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// One frame of the management-link sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Announce a new proxied stream to the backend, carrying the client's
    /// remote IP address.
    Open { stream_id: u64, addr: IpAddr },
    /// Raw stream data, in either direction.
    Packet { stream_id: u64, data: Bytes },
    /// The stream has ended; the receiver releases its state for the id.
    Close { stream_id: u64 },
}

impl Message {
    /// Build a Packet frame, rejecting oversized payloads up front. Callers
    /// with more than [`MAX_PACKET_PAYLOAD`] bytes chunk into multiple
    /// frames, preserving order.
    pub fn packet(stream_id: u64, data: Bytes) -> Result<Message, ProtoError> {
        if data.len() > MAX_PACKET_PAYLOAD {
            return Err(ProtoError::PayloadTooLarge(data.len()));
        }
        Ok(Message::Packet { stream_id, data })
    }

    pub fn stream_id(&self) -> u64 {
        match self {
            Message::Open { stream_id, .. }
            | Message::Packet { stream_id, .. }
            | Message::Close { stream_id } => *stream_id,
        }
    }

    /// Encode one frame. The caller flushes. Enum variant fields cannot be
    /// hidden, so the payload cap is re-checked here and an oversized Packet
    /// fails before any byte is written rather than truncating its length
    /// prefix.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtoError>
    where
        W: AsyncWrite + Unpin,
    {
        if let Message::Packet { data, .. } = self {
            if data.len() > MAX_PACKET_PAYLOAD {
                return Err(ProtoError::PayloadTooLarge(data.len()));
            }
        }
        writer.write_u64(self.stream_id()).await?;
        match self {
            Message::Open { addr, .. } => {
                writer.write_u8(KIND_OPEN).await?;
                match addr {
                    IpAddr::V4(v4) => {
                        writer.write_u8(4).await?;
                        writer.write_all(&v4.octets()).await?;
                    }
                    IpAddr::V6(v6) => {
                        writer.write_u8(16).await?;
                        writer.write_all(&v6.octets()).await?;
                    }
                }
            }
            Message::Packet { data, .. } => {
                writer.write_u8(KIND_PACKET).await?;
                writer.write_u16(data.len() as u16).await?;
                writer.write_all(data).await?;
            }
            Message::Close { .. } => {
                writer.write_u8(KIND_CLOSE).await?;
            }
        }
        Ok(())
    }

    /// Decode exactly one frame. Returns `Ok(None)` when the peer closed
    /// cleanly at a frame boundary.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Message>, ProtoError>
    where
        R: AsyncRead + Unpin,
    {
        let stream_id = match read_frame_start(reader).await? {
            Some(id) => id,
            None => return Ok(None),
        };

        match reader.read_u8().await.map_err(eof_as_truncated)? {
            KIND_OPEN => Err(ProtoError::ProtocolViolation),
            KIND_PACKET => {
                let len = reader.read_u16().await.map_err(eof_as_truncated)? as usize;
                let mut data = vec![0u8; len];
                reader
                    .read_exact(&mut data)
                    .await
                    .map_err(eof_as_truncated)?;
                Ok(Some(Message::Packet {
                    stream_id,
                    data: Bytes::from(data),
                }))
            }
            KIND_CLOSE => Ok(Some(Message::Close { stream_id })),
            kind => Err(ProtoError::UnknownKind(kind)),
        }
    }
}

/// Read the 8-byte stream id, distinguishing a clean close before any byte
/// (`None`) from one in the middle of the field (`Truncated`).
async fn read_frame_start<R>(reader: &mut R) -> Result<Option<u64>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtoError::Truncated);
        }
        filled += n;
    }
    Ok(Some(u64::from_be_bytes(buf)))
}

fn eof_as_truncated(err: std::io::Error) -> ProtoError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtoError::Truncated
    } else {
        ProtoError::Io(err)
    }
}
