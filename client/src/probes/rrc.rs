//! RRC state inference
//!
//! For each idle gap `i` (in units of [`GRANULARITY`]) the radio is pushed
//! into its high-power state with a large echo packet, left idle for the
//! gap, then probed with a small packet. A jump in RTT after some gap means
//! the radio was demoted and had to be promoted again.

use super::{resolve, split_host_port, unspecified_for, ProbeControl, ProbeSettings};
use crate::measurement::{MeasurementDescriptor, MeasurementError, Probe, ProbeValues};
use async_trait::async_trait;
use protocol::DEFAULT_ECHO_PORT;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;

pub const GRANULARITY: Duration = Duration::from_millis(500);
pub const DEFAULT_SIZE: usize = 31;
pub const DEFAULT_MIN_PACKET: usize = 0;
pub const DEFAULT_MAX_PACKET: usize = 1024;
pub const DEFAULT_GIVEUP_THRESHOLD: u32 = 15;
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(7);
/// RTT multiple over the gap-0 baseline that marks a promotion
pub const PROMOTION_FACTOR: i64 = 2;

/// First gap whose RTT exceeds twice the gap-0 baseline
pub fn infer_promotion_gap(rtts_ms: &[i64]) -> Option<usize> {
    let baseline = *rtts_ms.first()?;
    if baseline < 0 {
        return None;
    }
    rtts_ms
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, rtt)| **rtt >= 0 && **rtt > baseline.max(1) * PROMOTION_FACTOR)
        .map(|(i, _)| i)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, MeasurementError> {
    serde_json::to_string(value).map_err(|e| MeasurementError::failed(format!("Failed to encode result: {}", e)))
}

pub struct RrcProbe {
    echo_host: String,
    port: u16,
    size: usize,
    min_packet: usize,
    max_packet: usize,
    giveup_threshold: u32,
    granularity: Duration,
    echo_timeout: Duration,
    control: ProbeControl,
}

impl RrcProbe {
    pub fn new(descriptor: &MeasurementDescriptor, settings: &ProbeSettings) -> Result<Self, MeasurementError> {
        let server = descriptor
            .param("echo_host")
            .map(str::to_string)
            .or_else(|| settings.echo_server.clone())
            .ok_or_else(|| MeasurementError::invalid("echo_host", "no echo host and no echo server configured"))?;
        let (echo_host, configured_port) = split_host_port(&server, DEFAULT_ECHO_PORT);
        
        let positive = |name: &str, default: usize| -> Result<usize, MeasurementError> {
            let v: i64 = descriptor.param_or(name, 0)?;
            Ok(if v > 0 { v as usize } else { default })
        };
        let min_packet = positive("min", DEFAULT_MIN_PACKET)?;
        let max_packet = positive("max", DEFAULT_MAX_PACKET)?;
        if max_packet > u16::MAX as usize || min_packet > max_packet {
            return Err(MeasurementError::invalid("max", format!("packet sizes {}..{} are invalid", min_packet, max_packet)));
        }
        let port = match positive("port", 0)? {
            0 => configured_port,
            p => u16::try_from(p).map_err(|_| MeasurementError::invalid("port", format!("{} out of range", p)))?,
        };
        
        Ok(Self {
            echo_host,
            port,
            size: positive("size", DEFAULT_SIZE)?,
            min_packet,
            max_packet,
            giveup_threshold: positive("giveup_threshhold", DEFAULT_GIVEUP_THRESHOLD as usize)? as u32,
            granularity: GRANULARITY,
            echo_timeout: ECHO_TIMEOUT,
            control: ProbeControl::new(),
        })
    }
    
    /// Round trip of one datagram, `None` on timeout
    async fn echo(&self, socket: &UdpSocket, size: usize) -> Result<Option<Duration>, MeasurementError> {
        let payload = vec![0u8; size];
        let mut buf = vec![0u8; self.max_packet.max(64)];
        let start = Instant::now();
        socket
            .send(&payload)
            .await
            .map_err(|e| MeasurementError::failed(format!("Error sending to echo host {}: {}", self.echo_host, e)))?;
        self.control.add_bytes(size as u64);
        
        match self.control.guard(tokio::time::timeout(self.echo_timeout, socket.recv(&mut buf))).await? {
            Ok(Ok(n)) => {
                self.control.add_bytes(n as u64);
                Ok(Some(start.elapsed()))
            }
            Ok(Err(e)) => Err(MeasurementError::failed(format!("Error reading from echo host {}: {}", self.echo_host, e))),
            Err(_) => Ok(None),
        }
    }
    
    /// Small-packet RTT after `gap` granularity units of idle time, or -1
    async fn measure_gap(&self, socket: &UdpSocket, gap: usize) -> Result<i64, MeasurementError> {
        for attempt in 0..self.giveup_threshold {
            self.control.check()?;
            if self.echo(socket, self.max_packet).await?.is_none() {
                debug!("Promotion packet timed out (gap {}, attempt {})", gap, attempt);
                continue;
            }
            self.control.sleep(self.granularity * gap as u32).await?;
            match self.echo(socket, self.min_packet).await? {
                Some(rtt) => return Ok(rtt.as_millis() as i64),
                None => debug!("Probe packet timed out (gap {}, attempt {})", gap, attempt),
            }
        }
        Ok(-1)
    }
}

#[async_trait]
impl Probe for RrcProbe {
    async fn run(&self) -> Result<ProbeValues, MeasurementError> {
        let addr: SocketAddr = resolve(&self.echo_host, self.port).await?;
        let socket = UdpSocket::bind(unspecified_for(&addr))
            .await
            .map_err(|e| MeasurementError::failed(format!("Failed to bind UDP socket: {}", e)))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| MeasurementError::failed(format!("Failed to connect to {}: {}", addr, e)))?;
        
        let mut rtts = Vec::with_capacity(self.size);
        for gap in 0..self.size {
            let rtt = self.measure_gap(&socket, gap).await?;
            debug!("RRC gap {} x {:?}: rtt {} ms", gap, self.granularity, rtt);
            rtts.push(rtt);
        }
        if rtts.iter().all(|rtt| *rtt < 0) {
            return Err(MeasurementError::failed(format!("Echo host {} never answered", self.echo_host)));
        }
        
        let times: Vec<usize> = (0..self.size).collect();
        let mut values = ProbeValues::new();
        values.insert("echo_host_ip".into(), addr.ip().to_string());
        values.insert("times".into(), to_json(&times)?);
        values.insert("rtts_ms".into(), to_json(&rtts)?);
        values.insert("granularity_ms".into(), self.granularity.as_millis().to_string());
        if let Some(gap) = infer_promotion_gap(&rtts) {
            values.insert("promotion_gap_ms".into(), (gap as u128 * self.granularity.as_millis()).to_string());
        }
        Ok(values)
    }
    
    fn stop(&self) {
        self.control.stop();
    }
    
    fn data_consumed(&self) -> u64 {
        self.control.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementKind;
    use chrono::Utc;
    
    fn descriptor(params: &[(&str, &str)]) -> MeasurementDescriptor {
        let mut b = MeasurementDescriptor::builder(MeasurementKind::Rrc);
        for (k, v) in params {
            b = b.param(*k, *v);
        }
        b.build(Utc::now())
    }
    
    /// Answers every datagram with an empty one
    async fn echo_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
                socket.send_to(&[], peer).await.unwrap();
            }
        });
        addr
    }
    
    #[test]
    fn test_infer_promotion_gap() {
        assert_eq!(infer_promotion_gap(&[40, 45, 42, 300, 310]), Some(3));
        assert_eq!(infer_promotion_gap(&[40, 45, 42]), None);
        assert_eq!(infer_promotion_gap(&[-1, 300]), None);
        assert_eq!(infer_promotion_gap(&[40, -1, 90]), Some(2));
        assert_eq!(infer_promotion_gap(&[]), None);
    }
    
    #[test]
    fn test_parameters() {
        let settings = ProbeSettings {
            echo_server: Some("echo.example.net".into()),
            ..Default::default()
        };
        let probe = RrcProbe::new(&descriptor(&[("size", "5"), ("max", "512")]), &settings).unwrap();
        assert_eq!(probe.echo_host, "echo.example.net");
        assert_eq!(probe.port, DEFAULT_ECHO_PORT);
        assert_eq!(probe.size, 5);
        assert_eq!(probe.max_packet, 512);
        assert_eq!(probe.giveup_threshold, DEFAULT_GIVEUP_THRESHOLD);
        
        assert!(RrcProbe::new(&descriptor(&[]), &ProbeSettings::default()).is_err());
        assert!(RrcProbe::new(&descriptor(&[("echo_host", "h"), ("min", "600"), ("max", "500")]), &settings).is_err());
    }
    
    #[tokio::test]
    async fn test_measures_every_gap() {
        let addr = echo_server().await;
        let mut probe = RrcProbe::new(
            &descriptor(&[("echo_host", addr.to_string().as_str()), ("size", "3"), ("max", "200")]),
            &ProbeSettings::default(),
        )
        .unwrap();
        probe.granularity = Duration::from_millis(10);
        
        let values = probe.run().await.unwrap();
        assert_eq!(values["times"], "[0,1,2]");
        let rtts: Vec<i64> = serde_json::from_str(&values["rtts_ms"]).unwrap();
        assert_eq!(rtts.len(), 3);
        assert!(rtts.iter().all(|r| *r >= 0));
        assert_eq!(values["granularity_ms"], "10");
        // 3 promotion packets of 200 bytes plus empty probes and replies
        assert_eq!(probe.data_consumed(), 600);
    }
    
    #[tokio::test]
    async fn test_silent_echo_host_fails() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let mut probe = RrcProbe::new(
            &descriptor(&[("echo_host", addr.to_string().as_str()), ("size", "2"), ("giveup_threshhold", "1")]),
            &ProbeSettings::default(),
        )
        .unwrap();
        probe.echo_timeout = Duration::from_millis(50);
        
        assert!(matches!(probe.run().await, Err(MeasurementError::Failed(_))));
    }
}
