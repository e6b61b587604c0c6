//! Built-in measurement probes
//!
//! Every probe owns a [`ProbeControl`]: a cancellation token checked between
//! packets and a byte counter reported through `data_consumed()`.

pub mod dns;
pub mod http;
pub mod ping;
pub mod rrc;
pub mod tcp_throughput;
pub mod traceroute;
pub mod udp_burst;

use crate::measurement::MeasurementError;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Deployment-specific defaults for probes
#[derive(Debug, Clone, Default)]
pub struct ProbeSettings {
    /// host:port of the UDP burst server
    pub burst_server: Option<String>,
    /// Host of the TCP throughput server
    pub throughput_server: Option<String>,
    /// host:port of the UDP echo server
    pub echo_server: Option<String>,
}

/// Target value that asks for the configured measurement server
pub const MEASUREMENT_SERVER_TARGET: &str = "m-lab";

#[derive(Debug, Default)]
pub struct ProbeControl {
    cancel: CancellationToken,
    bytes: AtomicU64,
}

impl ProbeControl {
    pub fn new() -> Self {
        Self::default()
    }
    
    pub fn stop(&self) {
        self.cancel.cancel();
    }
    
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }
    
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
    
    /// Fail fast once stopped
    pub fn check(&self) -> Result<(), MeasurementError> {
        if self.cancel.is_cancelled() {
            Err(MeasurementError::Cancelled)
        } else {
            Ok(())
        }
    }
    
    /// Run `fut` unless the probe is stopped first
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, MeasurementError> {
        tokio::select! {
            out = fut => Ok(out),
            _ = self.cancel.cancelled() => Err(MeasurementError::Cancelled),
        }
    }
    
    pub async fn sleep(&self, d: Duration) -> Result<(), MeasurementError> {
        self.guard(tokio::time::sleep(d)).await
    }
}

/// Pick the explicit target, or the configured server when the target is
/// missing or names the measurement server
pub fn server_target(
    param: Option<&str>,
    configured: Option<&String>,
    name: &str,
) -> Result<String, MeasurementError> {
    match param {
        Some(t) if !t.is_empty() && t != MEASUREMENT_SERVER_TARGET => Ok(t.to_string()),
        _ => configured
            .cloned()
            .ok_or_else(|| MeasurementError::invalid(name, "no target and no server configured")),
    }
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals
pub fn split_host_port(s: &str, default_port: u16) -> (String, u16) {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return (addr.ip().to_string(), addr.port());
    }
    if s.parse::<IpAddr>().is_ok() {
        return (s.to_string(), default_port);
    }
    match s.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.trim_matches(|c| c == '[' || c == ']').to_string(), port),
            Err(_) => (s.to_string(), default_port),
        },
        None => (s.to_string(), default_port),
    }
}

/// Resolve to the first address
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, MeasurementError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| MeasurementError::failed(format!("target {} cannot be resolved: {}", host, e)))?
        .next()
        .ok_or_else(|| MeasurementError::failed(format!("target {} cannot be resolved", host)))
}

/// Local wildcard address of the same family
pub fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
