//! Smite Protocol Definitions
//!
//! This crate defines the tunnel data model shared by the panel and its nodes,
//! the messages exchanged over the secure channel, and the frame codec used to
//! put those messages on a QUIC stream.

pub mod codec;
pub mod messages;
pub mod tunnel;

pub use codec::{ChannelCodec, CodecError};
pub use messages::*;
pub use tunnel::{
    validate_tunnel_id, InvalidTunnelId, TunnelIntent, TunnelRecord, TunnelSpec, TunnelState,
    TunnelType, UnknownTunnelType, UsageSample, MAX_TUNNEL_ID_LEN,
};

/// Protocol version, sent in the node handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// ALPN identifier negotiated on the secure channel
pub const ALPN_PROTOCOL: &str = "smite-v1";
