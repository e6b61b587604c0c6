//! UDP burst handler
//!
//! A `Request` asks for a downlink burst: `burst_count` data packets of
//! `packet_size` bytes, `udp_interval` ms apart. `Data` packets are an
//! uplink burst and are summarised by the session manager.

use crate::config::LimitsConfig;
use crate::session::SessionManager;
use protocol::packets::BurstPacket;
use protocol::{PacketType, ProtocolError};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum BurstError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    
    #[error("Burst exceeds server limits: {0}")]
    OverLimit(String),
    
    #[error("Unexpected {0:?} packet")]
    Unexpected(PacketType),
    
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn check_limits(packet: &BurstPacket, limits: &LimitsConfig) -> Result<(), BurstError> {
    packet.validate()?;
    if packet.burst_count > limits.max_burst_count {
        return Err(BurstError::OverLimit(format!(
            "burst count {} above {}",
            packet.burst_count, limits.max_burst_count
        )));
    }
    if packet.packet_size as usize > limits.max_packet_size {
        return Err(BurstError::OverLimit(format!(
            "packet size {} above {}",
            packet.packet_size, limits.max_packet_size
        )));
    }
    Ok(())
}

/// Handle one datagram received on the burst port
pub async fn handle_burst(
    data: &[u8],
    client_addr: SocketAddr,
    socket: &UdpSocket,
    sessions: &SessionManager,
    limits: &LimitsConfig,
) -> Result<(), BurstError> {
    let packet = BurstPacket::from_bytes(data)?;
    
    if let Err(e) = check_limits(&packet, limits) {
        socket.send_to(&BurstPacket::error(packet.seq).to_bytes(), client_addr).await?;
        return Err(e);
    }
    
    match packet.packet_type {
        PacketType::Request => send_downlink(&packet, client_addr, socket).await,
        PacketType::Data => {
            if let Some(response) = sessions.record(client_addr, &packet, data.len(), now_ms()).await {
                debug!(
                    "Uplink burst {} from {}: {}/{} received",
                    packet.seq, client_addr, response.packet_num, packet.burst_count
                );
                socket.send_to(&response.to_bytes(), client_addr).await?;
            }
            Ok(())
        }
        other => Err(BurstError::Unexpected(other)),
    }
}

async fn send_downlink(request: &BurstPacket, client_addr: SocketAddr, socket: &UdpSocket) -> Result<(), BurstError> {
    info!(
        "Downlink burst to {}: {} x {} bytes every {}ms (seq {})",
        client_addr, request.burst_count, request.packet_size, request.udp_interval, request.seq
    );
    let interval = Duration::from_millis(request.udp_interval as u64);
    for i in 0..request.burst_count {
        let packet = BurstPacket::data(
            request.burst_count,
            i,
            request.packet_size,
            request.seq,
            request.udp_interval,
            now_ms(),
        );
        socket.send_to(&packet.to_bytes(), client_addr).await?;
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(())
}
