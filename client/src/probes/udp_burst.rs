//! UDP burst loss/jitter/reordering against the burst server
//!
//! Uplink: the agent sends a burst of data packets and the server answers
//! with one response packet carrying its arrival metrics. Downlink: the
//! agent sends one request and measures the burst the server sends back.

use super::{now_ms, resolve, server_target, split_host_port, unspecified_for, ProbeControl, ProbeSettings};
use crate::measurement::{MeasurementDescriptor, MeasurementError, Probe, ProbeValues};
use async_trait::async_trait;
use protocol::metrics::BurstMetrics;
use protocol::packets::BurstPacket;
use protocol::{PacketType, DEFAULT_BURST_PORT, MAX_BURST_COUNT, MAX_BURST_INTERVAL_MS, MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub const DEFAULT_PACKET_SIZE: i32 = 100;
pub const DEFAULT_BURST_COUNT: i32 = 16;
pub const DEFAULT_INTERVAL_MS: i32 = 1;
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some(d) if d.eq_ignore_ascii_case("up") => Direction::Up,
            _ => Direction::Down,
        }
    }
}

/// Outcome of one burst
#[derive(Debug, Clone, Copy, PartialEq)]
struct BurstOutcome {
    received: i32,
    inversions: i64,
    jitter_ms: f64,
}

pub struct UdpBurstProbe {
    target: String,
    port: u16,
    direction: Direction,
    packet_size: i32,
    burst_count: i32,
    interval_ms: i32,
    receive_timeout: Duration,
    seq: i32,
    control: ProbeControl,
}

impl UdpBurstProbe {
    pub fn new(descriptor: &MeasurementDescriptor, settings: &ProbeSettings) -> Result<Self, MeasurementError> {
        let server = server_target(descriptor.param("target"), settings.burst_server.as_ref(), "target")?;
        let (target, configured_port) = split_host_port(&server, DEFAULT_BURST_PORT);
        let port = descriptor.param_or("dst_port", configured_port)?;
        
        let packet_size = descriptor.param_or("packet_size_byte", DEFAULT_PACKET_SIZE)?;
        if packet_size < MIN_PACKET_SIZE as i32 || packet_size > MAX_PACKET_SIZE as i32 {
            return Err(MeasurementError::invalid(
                "packet_size_byte",
                format!("{} outside {}..={}", packet_size, MIN_PACKET_SIZE, MAX_PACKET_SIZE),
            ));
        }
        let burst_count = descriptor.param_or("packet_burst", DEFAULT_BURST_COUNT)?;
        if burst_count <= 0 || burst_count > MAX_BURST_COUNT {
            return Err(MeasurementError::invalid("packet_burst", format!("{} outside 1..={}", burst_count, MAX_BURST_COUNT)));
        }
        let interval_ms = descriptor.param_or("udp_interval", DEFAULT_INTERVAL_MS)?;
        if !(0..=MAX_BURST_INTERVAL_MS).contains(&interval_ms) {
            return Err(MeasurementError::invalid("udp_interval", format!("{} outside 0..={}", interval_ms, MAX_BURST_INTERVAL_MS)));
        }
        
        Ok(Self {
            target,
            port,
            direction: Direction::parse(descriptor.param("direction")),
            packet_size,
            burst_count,
            interval_ms,
            receive_timeout: RECEIVE_TIMEOUT,
            seq: rand::random::<u16>() as i32,
            control: ProbeControl::new(),
        })
    }
    
    async fn open(&self) -> Result<(UdpSocket, SocketAddr), MeasurementError> {
        let addr = resolve(&self.target, self.port).await?;
        let socket = UdpSocket::bind(unspecified_for(&addr))
            .await
            .map_err(|e| MeasurementError::failed(format!("Failed to bind UDP socket: {}", e)))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| MeasurementError::failed(format!("Failed to connect to {}: {}", addr, e)))?;
        Ok((socket, addr))
    }
    
    async fn send(&self, socket: &UdpSocket, packet: &BurstPacket) -> Result<(), MeasurementError> {
        let bytes = packet.to_bytes();
        socket
            .send(&bytes)
            .await
            .map_err(|e| MeasurementError::failed(format!("Error sending to {}: {}", self.target, e)))?;
        self.control.add_bytes(bytes.len() as u64);
        Ok(())
    }
    
    /// Next packet, or `None` on timeout
    async fn receive(&self, socket: &UdpSocket) -> Result<Option<BurstPacket>, MeasurementError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let recv = tokio::time::timeout(self.receive_timeout, socket.recv(&mut buf));
        match self.control.guard(recv).await? {
            Ok(Ok(n)) => {
                self.control.add_bytes(n as u64);
                BurstPacket::from_bytes(&buf[..n])
                    .map(Some)
                    .map_err(|e| MeasurementError::failed(format!("Malformed packet from {}: {}", self.target, e)))
            }
            Ok(Err(e)) => Err(MeasurementError::failed(format!("Error reading from {}: {}", self.target, e))),
            Err(_) => Ok(None),
        }
    }
    
    async fn uplink(&self, socket: &UdpSocket) -> Result<BurstOutcome, MeasurementError> {
        for i in 0..self.burst_count {
            self.control.check()?;
            let packet = BurstPacket::data(self.burst_count, i, self.packet_size, self.seq, self.interval_ms, now_ms());
            self.send(socket, &packet).await?;
            self.control.sleep(Duration::from_millis(self.interval_ms as u64)).await?;
        }
        
        let response = self
            .receive(socket)
            .await?
            .ok_or_else(|| MeasurementError::failed(format!("Timed out reading from {}", self.target)))?;
        if response.packet_type != PacketType::Response {
            return Err(MeasurementError::failed(format!("Error: not a response packet! seq: {}", self.seq)));
        }
        if response.seq != self.seq {
            warn!("Response seq mismatch: sent {} got {}", self.seq, response.seq);
        }
        Ok(BurstOutcome {
            received: response.packet_num,
            inversions: response.inversion_num as i64,
            jitter_ms: response.timestamp as f64,
        })
    }
    
    async fn downlink(&self, socket: &UdpSocket) -> Result<BurstOutcome, MeasurementError> {
        let request = BurstPacket::request(self.burst_count, self.packet_size, self.seq, self.interval_ms, now_ms());
        self.send(socket, &request).await?;
        
        let mut metrics = BurstMetrics::new();
        for _ in 0..self.burst_count {
            let Some(packet) = self.receive(socket).await? else {
                break;
            };
            match packet.packet_type {
                PacketType::Data if packet.seq == self.seq => {
                    metrics.add_packet(packet.packet_num, now_ms() - packet.timestamp);
                }
                PacketType::Data => {
                    debug!("Dropping packet from old burst {}", packet.seq);
                    break;
                }
                PacketType::Error => {
                    return Err(MeasurementError::failed(format!("Server rejected burst {}", self.seq)));
                }
                other => {
                    return Err(MeasurementError::failed(format!("Error: not a data packet ({:?})! seq: {}", other, self.seq)));
                }
            }
        }
        Ok(BurstOutcome {
            received: metrics.received() as i32,
            inversions: metrics.inversion_number() as i64,
            jitter_ms: metrics.jitter_ms(),
        })
    }
}

#[async_trait]
impl Probe for UdpBurstProbe {
    async fn run(&self) -> Result<ProbeValues, MeasurementError> {
        self.control.check()?;
        let (socket, addr) = self.open().await?;
        debug!("UDP burst {:?} to {} ({} x {} bytes)", self.direction, addr, self.burst_count, self.packet_size);
        
        let outcome = match self.direction {
            Direction::Up => self.uplink(&socket).await?,
            Direction::Down => self.downlink(&socket).await?,
        };
        
        let response_rate = outcome.received.clamp(0, self.burst_count) as f64 / self.burst_count as f64;
        let mut values = ProbeValues::new();
        values.insert("target_ip".into(), addr.ip().to_string());
        values.insert("loss_rate".into(), format!("{:.4}", 1.0 - response_rate));
        values.insert("inversion_number".into(), outcome.inversions.to_string());
        values.insert("jitter".into(), format!("{:.3}", outcome.jitter_ms));
        Ok(values)
    }
    
    fn stop(&self) {
        self.control.stop();
    }
    
    fn data_consumed(&self) -> u64 {
        self.control.bytes()
    }
}
