//! Measurement results

use super::descriptor::MeasurementDescriptor;
use super::kind::MeasurementKind;
use chrono::{DateTime, Utc};
use protocol::wire::{DeviceProperty, WireResult};
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementResult {
    pub device_id: String,
    pub properties: DeviceProperty,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub descriptor: MeasurementDescriptor,
    pub values: BTreeMap<String, String>,
}

impl MeasurementResult {
    pub fn new(
        device_id: String,
        properties: DeviceProperty,
        descriptor: MeasurementDescriptor,
        timestamp: DateTime<Utc>,
        success: bool,
    ) -> Self {
        Self {
            device_id,
            properties,
            timestamp,
            success,
            descriptor,
            values: BTreeMap::new(),
        }
    }
    
    /// Failed result carrying the error text under `error`
    pub fn failure(
        device_id: String,
        properties: DeviceProperty,
        descriptor: MeasurementDescriptor,
        timestamp: DateTime<Utc>,
        error: &str,
    ) -> Self {
        let mut result = Self::new(device_id, properties, descriptor, timestamp, false);
        result.add("error", error);
        result
    }
    
    pub fn kind(&self) -> MeasurementKind {
        self.descriptor.kind
    }
    
    pub fn task_key(&self) -> Option<&str> {
        self.descriptor.key.as_deref()
    }
    
    pub fn add(&mut self, name: &str, value: impl ToString) {
        self.values.insert(name.to_string(), value.to_string());
    }
    
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
    
    pub fn to_wire(&self) -> WireResult {
        WireResult {
            device_id: self.device_id.clone(),
            properties: self.properties.clone(),
            timestamp: self.timestamp.timestamp_micros(),
            success: self.success,
            task_key: self.descriptor.key.clone(),
            kind: self.kind().tag().to_string(),
            descriptor: self.descriptor.to_wire_stripped(),
            values: self.values.clone(),
        }
    }
    
    /// Human readable rendering for consoles and the CLI
    pub fn render(&self) -> String {
        let mut out = String::new();
        let d = &self.descriptor;
        let target = d
            .param("target")
            .or_else(|| d.param("url"))
            .unwrap_or("Unknown");
        
        let _ = writeln!(out, "[{}]", header(d));
        let _ = writeln!(out, "Target: {}", target);
        let _ = writeln!(out, "Timestamp: {}", self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(
            out,
            "Network: {}  Battery: {}%{}",
            self.properties.network_type,
            self.properties.battery_level,
            if self.properties.is_battery_charging { " (charging)" } else { "" }
        );
        
        if !self.success {
            match self.value("error") {
                Some(e) => {
                    let _ = writeln!(out, "Failed: {}", e);
                }
                None => {
                    let _ = writeln!(out, "Failed");
                }
            }
            return out;
        }
        
        match d.kind {
            MeasurementKind::Ping => self.render_ping(&mut out),
            MeasurementKind::Traceroute => self.render_traceroute(&mut out),
            MeasurementKind::DnsLookup => {
                let _ = writeln!(out, "Address: {}", self.value("address").unwrap_or("Unknown"));
                let _ = writeln!(out, "Lookup time: {} ms", self.value("time_ms").unwrap_or("?"));
            }
            MeasurementKind::Http => self.render_http(&mut out),
            MeasurementKind::UdpBurst => {
                let _ = writeln!(out, "IP addr: {}", self.value("target_ip").unwrap_or("Unknown"));
                let _ = writeln!(out, "Loss ratio: {:.2}%", self.num("loss_rate").unwrap_or(0.0) * 100.0);
                let _ = writeln!(out, "Inversions: {}", self.value("inversion_number").unwrap_or("?"));
                let _ = writeln!(out, "Jitter: {} ms", self.value("jitter").unwrap_or("?"));
            }
            MeasurementKind::TcpThroughput => self.render_tcp(&mut out),
            MeasurementKind::Rrc => {
                let _ = writeln!(out, "Gaps (x500ms): {}", self.value("times").unwrap_or("[]"));
                let _ = writeln!(out, "RTTs (ms): {}", self.value("rtts_ms").unwrap_or("[]"));
                if let Some(gap) = self.value("promotion_gap_ms") {
                    let _ = writeln!(out, "Inferred demotion after {} ms idle", gap);
                }
            }
        }
        out
    }
    
    fn num(&self, name: &str) -> Option<f64> {
        self.value(name).and_then(|v| v.trim_matches('"').parse().ok())
    }
    
    fn render_ping(&self, out: &mut String) {
        let _ = writeln!(out, "IP address: {}", self.value("target_ip").unwrap_or("Unknown"));
        let sent = self.num("packets_sent").unwrap_or(0.0);
        let loss = self.num("packet_loss").unwrap_or(0.0);
        let _ = writeln!(
            out,
            "{} packets transmitted, {} received, {:.1}% packet loss",
            sent as u64,
            (sent * (1.0 - loss)).round() as u64,
            loss * 100.0
        );
        for (label, key) in [
            ("Mean RTT", "mean_rtt_ms"),
            ("Min RTT ", "min_rtt_ms"),
            ("Max RTT ", "max_rtt_ms"),
            ("Std dev ", "stddev_rtt_ms"),
        ] {
            if let Some(v) = self.num(key) {
                let _ = writeln!(out, "{}: {:.1} ms", label, v);
            }
        }
    }
    
    fn render_traceroute(&self, out: &mut String) {
        let hops = self.num("num_hops").unwrap_or(0.0) as usize;
        for i in 0..hops {
            let addr = self
                .value(&format!("hop_{}_addr_1", i))
                .unwrap_or("*");
            match self.num(&format!("hop_{}_rtt_ms", i)) {
                Some(rtt) => {
                    let _ = writeln!(out, "{:>3} {:<16}{:6.2} ms", i + 1, addr, rtt);
                }
                None => {
                    let _ = writeln!(out, "{:>3} {:<16}     *", i + 1, addr);
                }
            }
        }
    }
    
    fn render_http(&self, out: &mut String) {
        let headers = self.num("headers_len").unwrap_or(0.0);
        let body = self.num("body_len").unwrap_or(0.0);
        let time = self.num("time_ms").unwrap_or(0.0);
        let _ = writeln!(out, "Status code: {}", self.value("code").unwrap_or("?"));
        let _ = writeln!(out, "Downloaded {} bytes in {} ms", (headers + body) as u64, time as u64);
        if time > 0.0 {
            let _ = writeln!(out, "Bandwidth: {:.0} Kbps", (headers + body) * 8.0 / time);
        }
    }
    
    fn render_tcp(&self, out: &mut String) {
        let samples: Vec<f64> = self
            .value("tcp_speed_results")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        match crate::analysis::median(&samples) {
            None => {
                let _ = writeln!(out, "No results available.");
            }
            Some(kbps) if kbps > 1024.0 * 1024.0 => {
                let _ = writeln!(out, "Speed: {:.2} Gbps", kbps / (1024.0 * 1024.0));
            }
            Some(kbps) if kbps > 1024.0 => {
                let _ = writeln!(out, "Speed: {:.2} Mbps", kbps / 1024.0);
            }
            Some(kbps) => {
                let _ = writeln!(out, "Speed: {:.2} Kbps", kbps);
            }
        }
        if self.value("data_limit_exceeded") == Some("true") {
            let _ = writeln!(out, "* Stopped early after reaching the data limit");
        }
    }
}

fn header(d: &MeasurementDescriptor) -> String {
    let up = d.param("direction").map(|v| v.eq_ignore_ascii_case("up")).unwrap_or(false);
    match d.kind {
        MeasurementKind::UdpBurst if up => "UDP Burst Up".to_string(),
        MeasurementKind::UdpBurst => "UDP Burst Down".to_string(),
        MeasurementKind::TcpThroughput if up => "TCP Uplink".to_string(),
        MeasurementKind::TcpThroughput => "TCP Downlink".to_string(),
        kind => kind.display_name().to_string(),
    }
}
