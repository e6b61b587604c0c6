//! Mobimeter Protocol Library
//!
//! Shared protocol definitions for Mobimeter agent/server communication.
//! This includes the UDP burst packet codec, the burst metrics computed on
//! both ends, and the JSON shapes exchanged with the checkin service.

pub mod constants;
pub mod error;
pub mod metrics;
pub mod packets;
pub mod wire;

pub use constants::*;
pub use error::ProtocolError;

/// Protocol version reported by the measurement server
pub const PROTOCOL_VERSION: u8 = 1;

/// Minimum burst packet size (header only)
pub const MIN_PACKET_SIZE: usize = packets::BurstPacket::HEADER_SIZE;

/// Maximum burst packet size accepted by either end
pub const MAX_PACKET_SIZE: usize = 512;
