//! Relay error taxonomy

use hostlink_proto::minecraft::McError;
use hostlink_proto::{ProtoError, ServerId};
use std::io;
use thiserror::Error;

/// Errors raised by the relay. Everything except [`RelayError::Bind`] stays
/// contained to the connection task it happened on.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {role} listener on port {port}: {source}")]
    Bind {
        role: &'static str,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("server id {0} is already registered")]
    DuplicateServerId(ServerId),

    #[error("server {0} did not come back within the reconnect window")]
    ReconnectTimeout(ServerId),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Minecraft(#[from] McError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Terminations that are part of normal socket churn and are never
    /// logged as errors: clean EOF and forcible resets.
    pub fn is_benign(&self) -> bool {
        match self {
            RelayError::Io(e) | RelayError::Proto(ProtoError::Io(e)) => is_benign_io(e),
            RelayError::Minecraft(McError::Io(e)) => is_benign_io(e),
            _ => false,
        }
    }
}

fn is_benign_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
