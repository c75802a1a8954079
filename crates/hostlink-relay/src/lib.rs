//! hostlink relay
//!
//! The relay lets a single outbound management link from a backend game
//! server carry many independent client connections, so servers behind
//! NAT or a firewall can be reached through one public endpoint.
//!
//! Two listeners run side by side: the management listener accepts
//! long-lived backend links that identify themselves with a [`ServerId`],
//! and the game listener accepts ordinary Minecraft clients, reads the
//! server id out of their handshake's hostname, and tunnels their bytes
//! over the matching link.

pub mod config;
pub mod error;
pub mod link;
pub mod management;
pub mod proxy;
pub mod registry;

pub use config::RelayConfig;
pub use error::RelayError;
pub use link::Link;
pub use registry::{Registry, StreamCommand};

pub use hostlink_proto::ServerId;

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Bind both listeners and drive the two accept loops until the process
/// exits. Bind failures are the only startup-fatal errors; everything that
/// happens on an accepted connection stays contained to its task.
pub async fn run(config: RelayConfig) -> Result<(), RelayError> {
    info!("starting hostlink relay with {:?}", config);

    let management = bind("management", config.management_port).await?;
    let game = bind("game", config.game_port).await?;

    let config = Arc::new(config);
    let registry = Arc::new(Registry::new());

    tokio::try_join!(
        management::serve(management, registry.clone()),
        proxy::serve(game, registry, config),
    )?;
    Ok(())
}

async fn bind(role: &'static str, port: u16) -> Result<TcpListener, RelayError> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|source| RelayError::Bind { role, port, source })
}
