//! hostlink relay binary
//!
//! Binds the management and game listeners and runs the relay until killed.

use anyhow::Result;
use clap::Parser;
use hostlink_relay::RelayConfig;
use tracing_subscriber::EnvFilter;

/// Connection-multiplexing reverse proxy for game servers behind NAT.
#[derive(Parser, Debug)]
#[command(name = "hostlink", version, about, long_about = None)]
struct Cli {
    /// Port to bind the management listener to
    #[arg(short = 'p', long, default_value_t = 9656, env = "HOSTLINK_MANAGEMENT_PORT")]
    management_port: u16,

    /// Base address of this relay; server ids are prepended to it as a
    /// hostname label (e.g. "42.<base-addr>")
    #[arg(short = 'a', long, env = "HOSTLINK_BASE_ADDR")]
    base_addr: String,

    /// Port to bind the game-client listener to
    #[arg(short = 'j', long, default_value_t = 25565, env = "HOSTLINK_GAME_PORT")]
    game_port: u16,

    /// Externally advertised game port, when a port mapping sits in front of
    /// the relay (defaults to the game port)
    #[arg(short = 'J', long)]
    advertised_game_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RelayConfig {
        management_port: cli.management_port,
        base_addr: cli.base_addr,
        game_port: cli.game_port,
        advertised_game_port: cli.advertised_game_port.unwrap_or(cli.game_port),
    };

    hostlink_relay::run(config).await?;
    Ok(())
}
