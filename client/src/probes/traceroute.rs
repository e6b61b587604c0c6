//! Traceroute over the system `ping` with increasing TTL
//!
//! Intermediate hops answer with ICMP time-exceeded, which only the system
//! ping reports back, so each probe is one `ping -c 1 -t <ttl>` run.

use super::{resolve, ProbeControl, ProbeSettings};
use crate::measurement::{MeasurementDescriptor, MeasurementError, Probe, ProbeValues};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

pub const DEFAULT_PACKET_SIZE: usize = 56;
pub const DEFAULT_PINGS_PER_HOP: u32 = 3;
pub const DEFAULT_MAX_HOP_COUNT: u32 = 30;
pub const DEFAULT_PING_INTERVAL_SEC: f64 = 0.5;
const PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
struct Hop {
    addrs: BTreeSet<String>,
    rtt_ms: Option<f64>,
}

pub struct TracerouteProbe {
    target: String,
    packet_size: usize,
    pings_per_hop: u32,
    max_hop_count: u32,
    interval: Duration,
    control: ProbeControl,
}

impl TracerouteProbe {
    pub fn new(descriptor: &MeasurementDescriptor, _settings: &ProbeSettings) -> Result<Self, MeasurementError> {
        let target = descriptor.require_param("target")?.to_string();
        let packet_size = descriptor.param_or("packet_size_byte", DEFAULT_PACKET_SIZE)?;
        let pings_per_hop = descriptor.param_or("pings_per_hop", DEFAULT_PINGS_PER_HOP)?;
        let max_hop_count = descriptor.param_or("max_hop_count", DEFAULT_MAX_HOP_COUNT)?;
        let interval_sec: f64 = descriptor.param_or("ping_interval_sec", DEFAULT_PING_INTERVAL_SEC)?;
        if pings_per_hop == 0 {
            return Err(MeasurementError::invalid("pings_per_hop", "must be positive"));
        }
        if max_hop_count == 0 || max_hop_count > 255 {
            return Err(MeasurementError::invalid("max_hop_count", "must be within 1..=255"));
        }
        if !interval_sec.is_finite() || interval_sec < 0.0 {
            return Err(MeasurementError::invalid("ping_interval_sec", "must be non-negative"));
        }
        Ok(Self {
            target,
            packet_size,
            pings_per_hop,
            max_hop_count,
            interval: Duration::from_secs_f64(interval_sec),
            control: ProbeControl::new(),
        })
    }
    
    async fn probe_hop(&self, ttl: u32, target_ip: IpAddr) -> Result<Hop, MeasurementError> {
        let mut addrs = BTreeSet::new();
        let mut total_ms = 0.0;
        let mut answered = 0u32;
        
        for _ in 0..self.pings_per_hop {
            self.control.check()?;
            let program = if target_ip.is_ipv6() { "ping6" } else { "ping" };
            let mut cmd = Command::new(program);
            cmd.args(["-n", "-c", "1", "-W", "2"])
                .arg("-t")
                .arg(ttl.to_string())
                .arg("-s")
                .arg(self.packet_size.to_string())
                .arg(target_ip.to_string())
                .kill_on_drop(true);
            
            self.control.add_bytes((self.packet_size as u64 + 28) * 2);
            let started = Instant::now();
            match self.control.guard(tokio::time::timeout(PROCESS_TIMEOUT, cmd.output())).await? {
                Ok(Ok(output)) => {
                    let found = parse_ping_output(&String::from_utf8_lossy(&output.stdout), target_ip);
                    if !found.is_empty() {
                        total_ms += started.elapsed().as_secs_f64() * 1000.0;
                        answered += 1;
                    }
                    addrs.extend(found);
                }
                Ok(Err(e)) => return Err(MeasurementError::failed(format!("Ping executable not found: {}", e))),
                Err(_) => debug!("Traceroute ping with ttl {} timed out", ttl),
            }
            self.control.sleep(self.interval).await?;
        }
        
        Ok(Hop {
            addrs,
            rtt_ms: (answered > 0).then(|| total_ms / answered as f64),
        })
    }
}

/// Addresses reporting back in one ping run: `From <addr>` lines are
/// intermediate routers, a `time=` line means the target itself answered
fn parse_ping_output(output: &str, target_ip: IpAddr) -> Vec<String> {
    let mut found = Vec::new();
    for line in output.lines() {
        if line.starts_with("From") {
            if let Some(ip) = first_ip(line) {
                if ip != target_ip {
                    found.push(ip.to_string());
                }
            }
        } else if line.contains("time=") {
            found.push(target_ip.to_string());
        }
    }
    found
}

fn first_ip(line: &str) -> Option<IpAddr> {
    line.split_whitespace()
        .map(|t| t.trim_matches(|c| c == ':' || c == '(' || c == ')'))
        .find_map(|t| t.parse().ok())
}

#[async_trait]
impl Probe for TracerouteProbe {
    async fn run(&self) -> Result<ProbeValues, MeasurementError> {
        let target_ip = resolve(&self.target, 0).await?.ip();
        let target_str = target_ip.to_string();
        let mut hops: Vec<Hop> = Vec::new();
        
        for ttl in 1..=self.max_hop_count {
            let hop = self.probe_hop(ttl, target_ip).await?;
            debug!("{}: {:?}", ttl, hop.addrs);
            let reached = hop.addrs.contains(&target_str);
            hops.push(hop);
            
            if reached {
                info!("{} reached in {} hops", self.target, ttl);
                let mut values = ProbeValues::new();
                values.insert("num_hops".into(), ttl.to_string());
                for (i, hop) in hops.iter().enumerate() {
                    if hop.addrs.is_empty() {
                        values.insert(format!("hop_{}_addr_1", i), "*".repeat(self.pings_per_hop as usize));
                    }
                    for (j, addr) in hop.addrs.iter().enumerate() {
                        values.insert(format!("hop_{}_addr_{}", i, j + 1), addr.clone());
                    }
                    values.insert(
                        format!("hop_{}_rtt_ms", i),
                        format!("{:.3}", hop.rtt_ms.unwrap_or(-1.0)),
                    );
                }
                return Ok(values);
            }
        }
        
        Err(MeasurementError::failed(format!(
            "{} not reached within {} hops",
            self.target, self.max_hop_count
        )))
    }
    
    fn stop(&self) {
        self.control.stop();
    }
    
    fn data_consumed(&self) -> u64 {
        self.control.bytes()
    }
}
