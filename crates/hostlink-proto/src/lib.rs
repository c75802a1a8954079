//! hostlink wire protocol
//!
//! This crate defines the management-link framing (one frame per proxied
//! stream event) and the small slice of the Minecraft protocol the relay
//! needs to peek at a client's handshake and answer with a disconnect.

pub mod id;
pub mod message;
pub mod minecraft;

pub use id::{ParseServerIdError, ServerId};
pub use message::{Message, ProtoError};

/// Largest payload a single Packet frame may carry.
pub const MAX_PACKET_PAYLOAD: usize = u16::MAX as usize;
