//! Management accept loop
//!
//! Accepts backend links, learns their [`ServerId`] from the 8-byte
//! handshake, registers them, then demultiplexes every inbound frame to the
//! client stream it belongs to. One task per link; a failing link never
//! affects its siblings.

use crate::error::RelayError;
use crate::link::{HandshakeError, Link};
use crate::registry::{Registry, StreamCommand};
use hostlink_proto::{Message, ProtoError, ServerId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// How long a fresh link keeps retrying registration while a dying
/// predecessor with the same id finishes deregistering.
const REGISTER_WINDOW: Duration = Duration::from_millis(500);
const REGISTER_POLL: Duration = Duration::from_millis(10);

/// Accept management links forever.
pub async fn serve(listener: TcpListener, registry: Arc<Registry>) -> Result<(), RelayError> {
    info!(
        "management server listening on {}",
        listener.local_addr()?
    );
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!("accepted management connection from {}", peer);
                let registry = registry.clone();
                tokio::spawn(handle_link(socket, peer, registry));
            }
            Err(e) => {
                error!("failed to accept management connection: {}", e);
            }
        }
    }
}

async fn handle_link(socket: TcpStream, peer: SocketAddr, registry: Arc<Registry>) {
    let link = Arc::new(Link::new(socket));

    match drive_link(&link, peer, &registry).await {
        Ok(()) => {}
        Err(RelayError::DuplicateServerId(id)) => {
            warn!("server id {} used twice, disconnecting {}", id, peer);
        }
        Err(e) if e.is_benign() => {
            debug!("management connection from {} ended: {}", peer, e);
        }
        Err(e) => {
            error!("error in management connection handling ({}): {}", peer, e);
        }
    }

    // Cleanup runs no matter how the link exited.
    let _ = link.shutdown().await;
    if link.id() != ServerId::ZERO {
        link.mark_closed();
        registry.remove_link(&link);
        info!(
            "management connection closed: {} ({} still open)",
            link.id(),
            registry.link_count()
        );
    }
}

async fn drive_link(
    link: &Arc<Link>,
    peer: SocketAddr,
    registry: &Registry,
) -> Result<(), RelayError> {
    let id = match link.handshake().await {
        Ok(id) => id,
        Err(HandshakeError::Probe) => {
            info!("received a ping connection from {} (immediate disconnect)", peer);
            return Ok(());
        }
        Err(e) => {
            warn!("invalid handshake from {}: {}", peer, e);
            return Ok(());
        }
    };
    info!("management connection opened: {} from {}", id, peer);

    let deadline = Instant::now() + REGISTER_WINDOW;
    while !registry.add_link(link) {
        if Instant::now() >= deadline {
            return Err(RelayError::DuplicateServerId(id));
        }
        tokio::time::sleep(REGISTER_POLL).await;
    }
    info!("{} management connections open", registry.link_count());

    loop {
        let message = match link.recv().await? {
            Some(message) => message,
            None => return Ok(()),
        };
        match message {
            Message::Packet { stream_id, data } => {
                let delivered = registry.with_stream(stream_id, id, |sender| {
                    let _ = sender.send(StreamCommand::Data(data));
                });
                if !delivered {
                    trace!("dropping packet for unknown or foreign stream {}", stream_id);
                }
            }
            Message::Close { stream_id } => {
                registry.with_stream(stream_id, id, |sender| {
                    let _ = sender.send(StreamCommand::Shutdown);
                });
            }
            // The codec refuses to decode Open on this side; this arm is the
            // in-depth assertion of the same invariant.
            Message::Open { .. } => {
                return Err(RelayError::Proto(ProtoError::ProtocolViolation));
            }
        }
    }
}
