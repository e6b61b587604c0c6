//! Device state - battery, network type and identity

use crate::config::DeviceConfig;
use anyhow::{Context, Result};
use protocol::wire::{DeviceInfo, DeviceProperty};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Wifi,
    Mobile,
    Wired,
    Unknown,
}

impl NetworkType {
    /// Traffic on this network counts against the data budget
    pub fn is_metered(self) -> bool {
        matches!(self, NetworkType::Mobile)
    }
    
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkType::Wifi => "WIFI",
            NetworkType::Mobile => "MOBILE",
            NetworkType::Wired => "WIRED",
            NetworkType::Unknown => "UNKNOWN",
        }
    }
    
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "wifi" | "wlan" => NetworkType::Wifi,
            "mobile" | "cellular" | "wwan" => NetworkType::Mobile,
            "wired" | "ethernet" => NetworkType::Wired,
            _ => NetworkType::Unknown,
        }
    }
    
    /// Classify by interface name
    pub fn from_interface(iface: &str) -> Self {
        if iface.starts_with("wl") {
            NetworkType::Wifi
        } else if iface.starts_with("ww") || iface.starts_with("rmnet") || iface.starts_with("usb") {
            NetworkType::Mobile
        } else if iface.starts_with("en") || iface.starts_with("eth") {
            NetworkType::Wired
        } else {
            NetworkType::Unknown
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of device identity and state
pub trait DeviceInfoProvider: Send + Sync {
    fn device_info(&self) -> DeviceInfo;
    fn device_property(&self) -> DeviceProperty;
    /// Battery charge, 0-100
    fn battery_level(&self) -> u8;
    fn is_charging(&self) -> bool;
    fn network_type(&self) -> NetworkType;
}

/// Linux host: sysfs power supplies and the default route
pub struct SystemDeviceInfo {
    info: DeviceInfo,
    config: DeviceConfig,
    power_supply_dir: PathBuf,
}

impl SystemDeviceInfo {
    pub fn new(device_id: String, config: DeviceConfig) -> Self {
        let info = DeviceInfo {
            device_id,
            manufacturer: config
                .manufacturer
                .clone()
                .or_else(|| read_trimmed("/sys/class/dmi/id/sys_vendor"))
                .unwrap_or_else(|| "unknown".to_string()),
            model: config
                .model
                .clone()
                .or_else(|| read_trimmed("/sys/class/dmi/id/product_name"))
                .unwrap_or_else(|| "unknown".to_string()),
            os: os_name(),
        };
        Self {
            info,
            config,
            power_supply_dir: PathBuf::from("/sys/class/power_supply"),
        }
    }
    
    fn battery(&self) -> Option<BatteryState> {
        read_battery(&self.power_supply_dir)
    }
}

impl DeviceInfoProvider for SystemDeviceInfo {
    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }
    
    fn device_property(&self) -> DeviceProperty {
        let route = detect_default_route().ok();
        DeviceProperty {
            device_id: self.info.device_id.clone(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().timestamp_micros(),
            os_version: read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default(),
            ip_connectivity: if route.is_some() { "IP connectivity" } else { "No connectivity" }.to_string(),
            dn_resolvability: String::new(),
            location: Default::default(),
            location_type: "none".to_string(),
            network_type: self.network_type().to_string(),
            carrier: self.config.carrier.clone().unwrap_or_default(),
            battery_level: self.battery_level(),
            is_battery_charging: self.is_charging(),
            cell_info: String::new(),
            rssi: 0,
        }
    }
    
    fn battery_level(&self) -> u8 {
        // Hosts without a battery are mains powered
        self.battery().map(|b| b.level).unwrap_or(100)
    }
    
    fn is_charging(&self) -> bool {
        self.battery().map(|b| b.charging).unwrap_or(true)
    }
    
    fn network_type(&self) -> NetworkType {
        if let Some(t) = &self.config.network_type {
            return NetworkType::parse(t);
        }
        match detect_default_route() {
            Ok(route) => {
                debug!("Default route via {:?} on {}", route.gateway, route.interface);
                NetworkType::from_interface(&route.interface)
            }
            Err(e) => {
                debug!("No default route: {}", e);
                NetworkType::Unknown
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BatteryState {
    level: u8,
    charging: bool,
}

fn read_battery(dir: &Path) -> Option<BatteryState> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if read_trimmed(path.join("type")).as_deref() != Some("Battery") {
            continue;
        }
        let level = read_trimmed(path.join("capacity"))?.parse::<u8>().ok()?.min(100);
        let status = read_trimmed(path.join("status")).unwrap_or_default();
        return Some(BatteryState {
            level,
            charging: matches!(status.as_str(), "Charging" | "Full"),
        });
    }
    None
}

fn read_trimmed<P: AsRef<Path>>(path: P) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn os_name() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|s| parse_os_release(&s))
        .unwrap_or_else(|| std::env::consts::OS.to_string())
}

fn parse_os_release(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim_matches('"').to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Option<String>,
    pub interface: String,
}

/// Detect the default route using `ip route` command
pub fn detect_default_route() -> Result<DefaultRoute> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .context("Failed to execute 'ip route' command")?;
    
    if !output.status.success() {
        anyhow::bail!("Failed to get default route");
    }
    
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_default_route(&stdout)
        .ok_or_else(|| anyhow::anyhow!("Could not parse default route from 'ip route' output"))
}

/// Parse output like: "default via 192.168.1.1 dev wlan0 proto dhcp metric 600"
fn parse_default_route(stdout: &str) -> Option<DefaultRoute> {
    for line in stdout.lines() {
        if !line.starts_with("default") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let after = |word: &str| {
            parts
                .iter()
                .position(|p| *p == word)
                .and_then(|i| parts.get(i + 1))
                .map(|s| s.to_string())
        };
        if let Some(interface) = after("dev") {
            return Some(DefaultRoute {
                gateway: after("via"),
                interface,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_parse_default_route() {
        let route = parse_default_route("default via 192.168.1.1 dev wlp2s0 proto dhcp metric 600\n").unwrap();
        assert_eq!(route.gateway.as_deref(), Some("192.168.1.1"));
        assert_eq!(route.interface, "wlp2s0");
        assert_eq!(NetworkType::from_interface(&route.interface), NetworkType::Wifi);
        
        let route = parse_default_route("default dev wwan0 scope link\n").unwrap();
        assert_eq!(route.gateway, None);
        assert_eq!(NetworkType::from_interface(&route.interface), NetworkType::Mobile);
        
        assert!(parse_default_route("10.0.0.0/8 dev eth0\n").is_none());
    }
    
    #[test]
    fn test_read_battery_from_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let ac = dir.path().join("AC");
        std::fs::create_dir(&ac).unwrap();
        std::fs::write(ac.join("type"), "Mains\n").unwrap();
        
        let bat = dir.path().join("BAT0");
        std::fs::create_dir(&bat).unwrap();
        std::fs::write(bat.join("type"), "Battery\n").unwrap();
        std::fs::write(bat.join("capacity"), "40\n").unwrap();
        std::fs::write(bat.join("status"), "Discharging\n").unwrap();
        
        let state = read_battery(dir.path()).unwrap();
        assert_eq!(state, BatteryState { level: 40, charging: false });
    }
    
    #[test]
    fn test_network_type_override() {
        assert_eq!(NetworkType::parse("Mobile"), NetworkType::Mobile);
        assert!(NetworkType::Mobile.is_metered());
        assert!(!NetworkType::Wifi.is_metered());
    }
    
    #[test]
    fn test_parse_os_release() {
        let s = "NAME=Debian\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n";
        assert_eq!(parse_os_release(s).unwrap(), "Debian GNU/Linux 12 (bookworm)");
    }
}
