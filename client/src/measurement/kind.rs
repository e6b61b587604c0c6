//! Probe kinds

use super::error::MeasurementError;
use std::fmt;

/// Every probe the agent knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeasurementKind {
    Ping,
    Traceroute,
    DnsLookup,
    Http,
    UdpBurst,
    TcpThroughput,
    Rrc,
}

impl MeasurementKind {
    pub const ALL: [MeasurementKind; 7] = [
        MeasurementKind::Ping,
        MeasurementKind::Traceroute,
        MeasurementKind::DnsLookup,
        MeasurementKind::Http,
        MeasurementKind::UdpBurst,
        MeasurementKind::TcpThroughput,
        MeasurementKind::Rrc,
    ];
    
    /// Tag used in schedules and results
    pub fn tag(self) -> &'static str {
        match self {
            MeasurementKind::Ping => "ping",
            MeasurementKind::Traceroute => "traceroute",
            MeasurementKind::DnsLookup => "dns_lookup",
            MeasurementKind::Http => "http",
            MeasurementKind::UdpBurst => "udp_burst",
            MeasurementKind::TcpThroughput => "tcpthroughput",
            MeasurementKind::Rrc => "rrc",
        }
    }
    
    pub fn from_tag(tag: &str) -> Result<Self, MeasurementError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag)
            .ok_or_else(|| MeasurementError::UnknownMeasurementType(tag.to_string()))
    }
    
    /// Human readable name
    pub fn display_name(self) -> &'static str {
        match self {
            MeasurementKind::Ping => "ping",
            MeasurementKind::Traceroute => "traceroute",
            MeasurementKind::DnsLookup => "DNS lookup",
            MeasurementKind::Http => "HTTP",
            MeasurementKind::UdpBurst => "UDP burst",
            MeasurementKind::TcpThroughput => "TCP speed test",
            MeasurementKind::Rrc => "RRC inference",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
