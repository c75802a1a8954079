//! Management link
//!
//! One [`Link`] wraps one accepted management socket. The read and write
//! halves sit behind separate mutexes so the two directions never serialize
//! against each other, while concurrent senders (every proxied client shares
//! the link) are strictly ordered by the write lock.

use hostlink_proto::{Message, ProtoError, ServerId};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Failures while reading the 8-byte identification that opens a link.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer closed without sending anything. Health checks look exactly
    /// like this, so it is not treated as an error.
    #[error("peer disconnected before identifying")]
    Probe,

    #[error("peer disconnected mid-identification")]
    Truncated,

    #[error("peer identified with the reserved zero id")]
    ReservedId,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A connected backend's management link.
pub struct Link {
    id: OnceLock<ServerId>,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    open: AtomicBool,
}

impl Link {
    pub fn new(socket: TcpStream) -> Self {
        let (read_half, write_half) = socket.into_split();
        Link {
            id: OnceLock::new(),
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(BufWriter::new(write_half)),
            open: AtomicBool::new(true),
        }
    }

    /// Read the peer's 8-byte big-endian [`ServerId`]. Assigns the link's id
    /// exactly once and returns it.
    pub async fn handshake(&self) -> Result<ServerId, HandshakeError> {
        let mut reader = self.reader.lock().await;
        let mut buf = [0u8; 8];
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(if filled == 0 {
                    HandshakeError::Probe
                } else {
                    HandshakeError::Truncated
                });
            }
            filled += n;
        }
        let id = ServerId::new(u64::from_be_bytes(buf));
        if id == ServerId::ZERO {
            return Err(HandshakeError::ReservedId);
        }
        let _ = self.id.set(id);
        Ok(id)
    }

    /// The id learned during the handshake, or [`ServerId::ZERO`] before it.
    pub fn id(&self) -> ServerId {
        self.id.get().copied().unwrap_or(ServerId::ZERO)
    }

    /// Write one frame and flush. Concurrent senders queue on the write lock
    /// and their frames reach the peer in lock-acquisition order.
    pub async fn send(&self, message: &Message) -> Result<(), ProtoError> {
        let mut writer = self.writer.lock().await;
        message.write_to(&mut *writer).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Decode one frame. Only the management loop reads a link, but the lock
    /// guards against accidental concurrent use.
    pub async fn recv(&self) -> Result<Option<Message>, ProtoError> {
        let mut reader = self.reader.lock().await;
        Message::read_from(&mut *reader).await
    }

    /// Liveness hint: true until the management loop's cleanup runs. Read
    /// without synchronization; used to decide whether to keep sending or
    /// wait for a reconnect, never to gate correctness.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Flips the open flag to false. Never flips back; a reconnect creates a
    /// fresh `Link`.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    /// Best-effort close of the write half.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_handshake_assigns_id() {
        let (near, mut far) = socket_pair().await;
        let link = Link::new(near);
        assert_eq!(link.id(), ServerId::ZERO);

        far.write_all(&146u64.to_be_bytes()).await.unwrap();
        let id = link.handshake().await.unwrap();
        assert_eq!(id, ServerId::new(146));
        assert_eq!(link.id(), id);
        assert!(link.is_open());
    }

    #[tokio::test]
    async fn test_handshake_probe() {
        let (near, far) = socket_pair().await;
        drop(far);
        let link = Link::new(near);
        let err = link.handshake().await.unwrap_err();
        assert!(matches!(err, HandshakeError::Probe));
    }

    #[tokio::test]
    async fn test_handshake_truncated() {
        let (near, mut far) = socket_pair().await;
        let link = Link::new(near);
        far.write_all(&[0u8; 3]).await.unwrap();
        drop(far);
        let err = link.handshake().await.unwrap_err();
        assert!(matches!(err, HandshakeError::Truncated));
    }

    #[tokio::test]
    async fn test_handshake_rejects_zero_id() {
        let (near, mut far) = socket_pair().await;
        let link = Link::new(near);
        far.write_all(&0u64.to_be_bytes()).await.unwrap();
        let err = link.handshake().await.unwrap_err();
        assert!(matches!(err, HandshakeError::ReservedId));
        assert_eq!(link.id(), ServerId::ZERO);
    }

    #[tokio::test]
    async fn test_send_and_recv_frames() {
        let (near, far) = socket_pair().await;
        let sender = Link::new(near);
        let receiver = Link::new(far);

        let msg = Message::packet(9, Bytes::from_static(b"payload")).unwrap();
        sender.send(&msg).await.unwrap();
        sender.send(&Message::Close { stream_id: 9 }).await.unwrap();

        assert_eq!(receiver.recv().await.unwrap(), Some(msg));
        assert_eq!(
            receiver.recv().await.unwrap(),
            Some(Message::Close { stream_id: 9 })
        );
    }

    #[tokio::test]
    async fn test_recv_clean_eof() {
        let (near, far) = socket_pair().await;
        let link = Link::new(near);
        drop(far);
        assert_eq!(link.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mark_closed_is_one_way() {
        let (near, _far) = socket_pair().await;
        let link = Link::new(near);
        assert!(link.is_open());
        link.mark_closed();
        assert!(!link.is_open());
    }
}
