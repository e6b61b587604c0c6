//! UDP burst packet structures

use crate::constants::{MAX_BURST_COUNT, MAX_BURST_INTERVAL_MS, PacketType};
use crate::error::ProtocolError;
use crate::{MAX_PACKET_SIZE, MIN_PACKET_SIZE};

/// Burst packet (36-byte header, zero padding up to `packet_size`)
///
/// The same layout is used for all four packet types; the meaning of
/// `packet_num`, `inversion_num` and `timestamp` depends on the type:
///
/// | type     | packet_num        | inversion_num | timestamp        |
/// |----------|-------------------|---------------|------------------|
/// | Data     | index in burst    | unused        | sender clock, ms |
/// | Request  | unused            | unused        | sender clock, ms |
/// | Response | packets received  | inversions    | jitter, ms       |
/// | Error    | unused            | unused        | unused           |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstPacket {
    /// Packet type (4 bytes)
    pub packet_type: PacketType,
    /// Number of packets in the burst (4 bytes)
    pub burst_count: i32,
    /// Packet index or received count (4 bytes)
    pub packet_num: i32,
    /// Out-of-order count, responses only (4 bytes)
    pub inversion_num: i32,
    /// Milliseconds since epoch, or jitter for responses (8 bytes)
    pub timestamp: i64,
    /// Total on-wire size including padding (4 bytes)
    pub packet_size: i32,
    /// Burst sequence number chosen by the agent (4 bytes)
    pub seq: i32,
    /// Spacing between data packets in milliseconds (4 bytes)
    pub udp_interval: i32,
}

impl BurstPacket {
    pub const HEADER_SIZE: usize = 36;
    
    fn new(packet_type: PacketType, burst_count: i32, packet_size: i32, seq: i32, udp_interval: i32) -> Self {
        Self {
            packet_type,
            burst_count,
            packet_num: 0,
            inversion_num: 0,
            timestamp: 0,
            packet_size,
            seq,
            udp_interval,
        }
    }
    
    /// Downlink request asking the server for `burst_count` data packets
    pub fn request(burst_count: i32, packet_size: i32, seq: i32, udp_interval: i32, now_ms: i64) -> Self {
        let mut packet = Self::new(PacketType::Request, burst_count, packet_size, seq, udp_interval);
        packet.timestamp = now_ms;
        packet
    }
    
    /// Data packet number `packet_num` of a burst
    pub fn data(
        burst_count: i32,
        packet_num: i32,
        packet_size: i32,
        seq: i32,
        udp_interval: i32,
        now_ms: i64,
    ) -> Self {
        let mut packet = Self::new(PacketType::Data, burst_count, packet_size, seq, udp_interval);
        packet.packet_num = packet_num;
        packet.timestamp = now_ms;
        packet
    }
    
    /// Uplink summary computed by the server
    pub fn response(request: &BurstPacket, received: i32, inversions: i32, jitter_ms: i64) -> Self {
        let mut packet = Self::new(
            PacketType::Response,
            request.burst_count,
            request.packet_size,
            request.seq,
            request.udp_interval,
        );
        packet.packet_num = received;
        packet.inversion_num = inversions;
        packet.timestamp = jitter_ms;
        packet
    }
    
    pub fn error(seq: i32) -> Self {
        Self::new(PacketType::Error, 0, MIN_PACKET_SIZE as i32, seq, 0)
    }
    
    /// Check burst parameters against protocol limits
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.burst_count <= 0 || self.burst_count > MAX_BURST_COUNT {
            return Err(ProtocolError::InvalidBurst(format!(
                "burst count {} outside 1..={}",
                self.burst_count, MAX_BURST_COUNT
            )));
        }
        if self.packet_size < MIN_PACKET_SIZE as i32 || self.packet_size > MAX_PACKET_SIZE as i32 {
            return Err(ProtocolError::InvalidBurst(format!(
                "packet size {} outside {}..={}",
                self.packet_size, MIN_PACKET_SIZE, MAX_PACKET_SIZE
            )));
        }
        if self.udp_interval < 0 || self.udp_interval > MAX_BURST_INTERVAL_MS {
            return Err(ProtocolError::InvalidBurst(format!(
                "interval {}ms outside 0..={}",
                self.udp_interval, MAX_BURST_INTERVAL_MS
            )));
        }
        Ok(())
    }
    
    /// Encode, zero-padded to `packet_size` (never shorter than the header)
    pub fn to_bytes(&self) -> Vec<u8> {
        let total = (self.packet_size.max(0) as usize).clamp(Self::HEADER_SIZE, MAX_PACKET_SIZE);
        let mut bytes = Vec::with_capacity(total);
        bytes.extend_from_slice(&self.packet_type.to_i32().to_be_bytes());
        bytes.extend_from_slice(&self.burst_count.to_be_bytes());
        bytes.extend_from_slice(&self.packet_num.to_be_bytes());
        bytes.extend_from_slice(&self.inversion_num.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes.extend_from_slice(&self.packet_size.to_be_bytes());
        bytes.extend_from_slice(&self.seq.to_be_bytes());
        bytes.extend_from_slice(&self.udp_interval.to_be_bytes());
        bytes.resize(total, 0);
        bytes
    }
    
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(ProtocolError::PacketTooSmall {
                expected: Self::HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                max: MAX_PACKET_SIZE,
                actual: bytes.len(),
            });
        }
        
        let raw_type = read_i32(bytes, 0);
        let packet_type = PacketType::from_i32(raw_type)
            .ok_or(ProtocolError::InvalidPacketType(raw_type))?;
        
        Ok(Self {
            packet_type,
            burst_count: read_i32(bytes, 4),
            packet_num: read_i32(bytes, 8),
            inversion_num: read_i32(bytes, 12),
            timestamp: i64::from_be_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19],
                bytes[20], bytes[21], bytes[22], bytes[23],
            ]),
            packet_size: read_i32(bytes, 24),
            seq: read_i32(bytes, 28),
            udp_interval: read_i32(bytes, 32),
        })
    }
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
