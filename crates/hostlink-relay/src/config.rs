//! Relay configuration

/// Runtime configuration, sourced by the CLI and handed to [`crate::run`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port the management listener binds.
    pub management_port: u16,
    /// Address the relay itself is reachable at. A client connecting with
    /// exactly this address (no server id label) gets the joke disconnect.
    pub base_addr: String,
    /// Port the game-client listener binds.
    pub game_port: u16,
    /// Game port to advertise externally, when a port mapping sits in front
    /// of the relay. Defaults to `game_port`.
    pub advertised_game_port: u16,
}
