//! Game-client accept loop
//!
//! Accepts Minecraft clients, reads the server id out of their handshake's
//! hostname, and multiplexes the raw byte stream onto the matching
//! management link. Each client gets a process-unique stream id and a small
//! writer task that owns the socket's write half; the management loop feeds
//! that task through the registry.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::link::Link;
use crate::registry::{Registry, StreamCommand};
use bytes::Bytes;
use hostlink_proto::minecraft::{self, Handshake};
use hostlink_proto::{Message, ServerId, MAX_PACKET_PAYLOAD};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// How long a client waits for its server to reconnect before giving up.
const RECONNECT_WINDOW: Duration = Duration::from_secs(5);
const RECONNECT_POLL: Duration = Duration::from_millis(20);

/// Read size of the client pump. Reads are re-chunked to fit Packet frames.
const CLIENT_READ_BUF: usize = 64 * 1024;

/// Accept game clients forever. Stream ids start at 0 and increment per
/// accepted connection for the lifetime of the loop; they are never reused
/// (the counter wraps, unreachably, after 2^64 connections).
pub async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    config: Arc<RelayConfig>,
) -> Result<(), RelayError> {
    info!("proxy server listening on {}", listener.local_addr()?);
    let mut next_stream_id: u64 = 0;
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!("accepted proxy connection from {}", peer);
                let stream_id = next_stream_id;
                next_stream_id = next_stream_id.wrapping_add(1);
                let registry = registry.clone();
                let config = config.clone();
                tokio::spawn(handle_client(socket, peer, stream_id, registry, config));
            }
            Err(e) => {
                error!("failed to accept proxy connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    peer: SocketAddr,
    stream_id: u64,
    registry: Arc<Registry>,
    config: Arc<RelayConfig>,
) {
    let mut link: Option<Arc<Link>> = None;

    match drive_client(socket, peer, stream_id, &registry, &config, &mut link).await {
        Ok(()) => {}
        Err(RelayError::ReconnectTimeout(id)) => {
            info!(
                "server {} did not come back within the grace window, dropping client {}",
                id, peer
            );
        }
        Err(e) if e.is_benign() => {
            debug!("proxy connection {} ended: {}", stream_id, e);
        }
        Err(e) => {
            error!("error in proxy client handling ({}): {}", peer, e);
        }
    }

    // Cleanup runs no matter how the client exited.
    registry.remove_stream(stream_id);
    if let Some(link) = link {
        if link.is_open() {
            let _ = link.send(&Message::Close { stream_id }).await;
        }
    }
    info!("proxy connection {} closed", stream_id);
}

async fn drive_client(
    socket: TcpStream,
    peer: SocketAddr,
    stream_id: u64,
    registry: &Arc<Registry>,
    config: &RelayConfig,
    current: &mut Option<Arc<Link>>,
) -> Result<(), RelayError> {
    let (mut read_half, mut write_half) = socket.into_split();

    let handshake_body = minecraft::read_packet(&mut read_half).await?;
    let handshake = Handshake::parse(&handshake_body)?;

    let label = handshake
        .server_address
        .split('.')
        .next()
        .unwrap_or_default();
    let dest = match label.parse::<ServerId>() {
        Ok(dest) => dest,
        Err(e) => {
            let message = if handshake.server_address == config.base_addr {
                "I'm a proxy server, not an engineer!".to_string()
            } else {
                format!("Invalid server id: {}", e)
            };
            info!(
                "disconnecting client {} for address {:?}: {}",
                peer, handshake.server_address, message
            );
            minecraft::send_disconnect(&mut write_half, handshake.next_state, &message).await?;
            return Ok(());
        }
    };

    let link = match registry.get_link(dest) {
        Some(link) => link,
        None => {
            info!("client {} asked for unknown server {}", peer, dest);
            minecraft::send_disconnect(
                &mut write_half,
                handshake.next_state,
                "Couldn't find that server",
            )
            .await?;
            return Ok(());
        }
    };
    *current = Some(link.clone());

    let (sender, receiver) = mpsc::unbounded_channel();
    registry.add_stream(stream_id, link.id(), sender);
    let writer = tokio::spawn(write_client(
        write_half,
        receiver,
        registry.clone(),
        stream_id,
    ));

    link.send(&Message::Open {
        stream_id,
        addr: peer.ip(),
    })
    .await?;
    // The backend gets the handshake exactly as the client sent it, length
    // prefix restored.
    let first = minecraft::frame_packet(&handshake_body);
    link.send(&Message::packet(stream_id, Bytes::from(first))?)
        .await?;

    let mut link = link;
    let mut buf = vec![0u8; CLIENT_READ_BUF];
    loop {
        let n = read_half.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if writer.is_finished() {
            // Client socket already closed for write; nowhere to deliver
            // replies, stop pumping.
            break;
        }
        if !link.is_open() {
            link = wait_for_return(registry, dest)
                .await
                .ok_or(RelayError::ReconnectTimeout(dest))?;
            debug!(
                "stream {} resumed on a reconnected link for {}",
                stream_id, dest
            );
            *current = Some(link.clone());
        }
        for chunk in buf[..n].chunks(MAX_PACKET_PAYLOAD) {
            link.send(&Message::packet(stream_id, Bytes::copy_from_slice(chunk))?)
                .await?;
        }
    }
    Ok(())
}

/// Poll the registry until a fresh open link for `id` shows up or the
/// reconnect window elapses.
async fn wait_for_return(registry: &Registry, id: ServerId) -> Option<Arc<Link>> {
    let deadline = Instant::now() + RECONNECT_WINDOW;
    loop {
        if let Some(link) = registry.get_link(id) {
            if link.is_open() {
                return Some(link);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(RECONNECT_POLL).await;
    }
}

/// Owns the client socket's write half. Ends when the backend closes the
/// stream, the write fails, or every sender is gone (stream deregistered).
/// Deregisters the stream itself on exit; the channel is unbounded, so a
/// backend flooding a finished stream must stop feeding it right away, not
/// when the client task's own cleanup eventually runs.
async fn write_client(
    mut write_half: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    registry: Arc<Registry>,
    stream_id: u64,
) {
    while let Some(command) = commands.recv().await {
        match command {
            StreamCommand::Data(data) => {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
            StreamCommand::Shutdown => break,
        }
    }
    registry.remove_stream(stream_id);
    let _ = write_half.shutdown().await;
}
