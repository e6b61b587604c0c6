//! Protocol constants and packet type definitions

/// Packet types for the UDP burst protocol
///
/// Encoded as a big-endian `i32` at the start of every burst packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PacketType {
    /// Server could not honour a request
    Error = 1,
    
    /// Uplink summary sent by the server (received count, inversions, jitter)
    Response = 2,
    
    /// Burst data packet (either direction)
    Data = 3,
    
    /// Downlink request from the agent
    Request = 4,
}

impl PacketType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(PacketType::Error),
            2 => Some(PacketType::Response),
            3 => Some(PacketType::Data),
            4 => Some(PacketType::Request),
            _ => None,
        }
    }
    
    pub fn to_i32(self) -> i32 {
        self as i32
    }
}

/// Default UDP burst server port
pub const DEFAULT_BURST_PORT: u16 = 31341;

/// Default UDP echo port used for RRC inference
pub const DEFAULT_ECHO_PORT: u16 = 31342;

/// TCP throughput: server streams data to the agent
pub const THROUGHPUT_DOWN_PORT: u16 = 6001;

/// TCP throughput: agent streams data to the server
pub const THROUGHPUT_UP_PORT: u16 = 6002;

/// TCP throughput: server version / configuration exchange
pub const THROUGHPUT_CONFIG_PORT: u16 = 6003;

/// Maximum packets in one burst
pub const MAX_BURST_COUNT: i32 = 100;

/// Maximum spacing between burst packets (milliseconds)
pub const MAX_BURST_INTERVAL_MS: i32 = 1000;

/// Version string reported on the throughput config port
pub const THROUGHPUT_SERVER_VERSION: &str = "mobimeter-tcp-1";
