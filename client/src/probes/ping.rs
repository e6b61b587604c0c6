//! ICMP ping

use super::{resolve, ProbeControl, ProbeSettings};
use crate::analysis;
use crate::measurement::{MeasurementDescriptor, MeasurementError, Probe, ProbeValues};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use surge_ping::{Client, Config as PingConfig, PingIdentifier, PingSequence, ICMP};
use tracing::debug;

pub const PING_COUNT: u16 = 10;
pub const DEFAULT_PACKET_SIZE: usize = 56;
pub const DEFAULT_TIMEOUT_SEC: u64 = 10;
pub const PING_INTERVAL: Duration = Duration::from_millis(500);
/// RTTs above this multiple of the minimum are left out of the filtered mean
pub const FILTER_THRESHOLD: f64 = 1.4;

/// IP + ICMP header bytes on top of the payload
const ICMP_OVERHEAD: u64 = 28;

pub struct PingProbe {
    target: String,
    packet_size: usize,
    timeout: Duration,
    control: ProbeControl,
}

impl PingProbe {
    pub fn new(descriptor: &MeasurementDescriptor, _settings: &ProbeSettings) -> Result<Self, MeasurementError> {
        let target = descriptor.require_param("target")?.to_string();
        let packet_size: usize = descriptor.param_or("packet_size_byte", DEFAULT_PACKET_SIZE)?;
        let timeout_sec: u64 = descriptor.param_or("ping_timeout_sec", DEFAULT_TIMEOUT_SEC)?;
        if packet_size == 0 || packet_size > 65_000 {
            return Err(MeasurementError::invalid("packet_size_byte", format!("{} out of range", packet_size)));
        }
        if timeout_sec == 0 {
            return Err(MeasurementError::invalid("ping_timeout_sec", "must be positive"));
        }
        Ok(Self {
            target,
            packet_size,
            timeout: Duration::from_secs(timeout_sec),
            control: ProbeControl::new(),
        })
    }
    
    async fn collect_rtts(&self, ip: IpAddr) -> Result<(Vec<f64>, u16), MeasurementError> {
        let config = match ip {
            IpAddr::V4(_) => PingConfig::default(),
            IpAddr::V6(_) => PingConfig::builder().kind(ICMP::V6).build(),
        };
        let client = Client::new(&config)
            .map_err(|e| MeasurementError::failed(format!("Failed to create ICMP client (CAP_NET_RAW required): {}", e)))?;
        let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(self.timeout);
        
        let payload = vec![0u8; self.packet_size];
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut rtts = Vec::new();
        let mut sent = 0u16;
        
        for seq in 0..PING_COUNT {
            self.control.check()?;
            if tokio::time::Instant::now() >= deadline {
                debug!("Ping to {} hit the overall timeout after {} packets", ip, sent);
                break;
            }
            sent += 1;
            self.control.add_bytes((self.packet_size as u64 + ICMP_OVERHEAD) * 2);
            match self.control.guard(pinger.ping(PingSequence(seq), &payload)).await? {
                Ok((_packet, rtt)) => rtts.push(rtt.as_secs_f64() * 1000.0),
                Err(e) => debug!("Ping {} seq {} failed: {}", ip, seq, e),
            }
            if seq + 1 < PING_COUNT {
                self.control.sleep(PING_INTERVAL).await?;
            }
        }
        Ok((rtts, sent))
    }
}

#[async_trait]
impl Probe for PingProbe {
    async fn run(&self) -> Result<ProbeValues, MeasurementError> {
        let ip = resolve(&self.target, 0).await?.ip();
        let (rtts, sent) = self.collect_rtts(ip).await?;
        
        let Some(stats) = analysis::calculate_statistics(&rtts) else {
            return Err(MeasurementError::failed(format!("No ping replies from {}", self.target)));
        };
        
        let mut values = ProbeValues::new();
        values.insert("target_ip".into(), ip.to_string());
        values.insert("mean_rtt_ms".into(), format!("{:.3}", stats.mean));
        values.insert("min_rtt_ms".into(), format!("{:.3}", stats.min));
        values.insert("max_rtt_ms".into(), format!("{:.3}", stats.max));
        values.insert("stddev_rtt_ms".into(), format!("{:.3}", stats.stddev));
        if let Some(filtered) = analysis::filtered_mean(&rtts, FILTER_THRESHOLD) {
            if filtered != stats.mean {
                values.insert("filtered_mean_rtt_ms".into(), format!("{:.3}", filtered));
            }
        }
        let loss = 1.0 - rtts.len() as f64 / sent.max(1) as f64;
        values.insert("packet_loss".into(), format!("{:.3}", loss));
        values.insert("packets_sent".into(), sent.to_string());
        values.insert("ping_method".into(), "icmp".into());
        Ok(values)
    }
    
    fn stop(&self) {
        self.control.stop();
    }
    
    fn data_consumed(&self) -> u64 {
        self.control.bytes()
    }
}
