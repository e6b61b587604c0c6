use crate::probes::ProbeSettings;
use crate::resource::{DataUsageProfile, DEFAULT_BATTERY_THRESHOLD, DEFAULT_PERIOD_DAYS};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Smallest allowed checkin interval
pub const MIN_CHECKIN_INTERVAL_SEC: u64 = 3600;

/// Generated device id, kept in the data directory
const DEVICE_ID_FILE: &str = "device_id";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub checkin: CheckinConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub probes: ProbesConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub start_paused: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            data_dir: default_data_dir(),
            start_paused: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckinConfig {
    pub server_url: String,
    #[serde(default = "default_checkin_interval")]
    pub interval_sec: u64,
    #[serde(default = "default_min_retry")]
    pub min_retry_interval_sec: u64,
    #[serde(default = "default_max_retry")]
    pub max_retry_interval_sec: u64,
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    #[serde(default = "default_timeout")]
    pub timeout_sec: u64,
    /// `name=value`; absent means the server needs no credential
    #[serde(default)]
    pub auth_cookie: Option<String>,
    /// Login email for a development server
    #[serde(default)]
    pub dev_login: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_battery_threshold")]
    pub battery_threshold_pct: u8,
    #[serde(default = "default_data_limit")]
    pub data_limit: String,
    #[serde(default = "default_period_days")]
    pub period_days: u32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            battery_threshold_pct: default_battery_threshold(),
            data_limit: default_data_limit(),
            period_days: default_period_days(),
        }
    }
}

impl ResourcesConfig {
    pub fn profile(&self) -> Result<DataUsageProfile> {
        DataUsageProfile::parse(&self.data_limit)
            .with_context(|| format!("Invalid data_limit: {:?}", self.data_limit))
    }
}

/// Overrides for what the host cannot report
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub carrier: Option<String>,
    pub network_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProbesConfig {
    /// host:port of the UDP burst server
    pub burst_server: Option<String>,
    /// host of the TCP throughput server
    pub throughput_server: Option<String>,
    /// host:port of the UDP echo server used by RRC inference
    pub echo_server: Option<String>,
}

impl ProbesConfig {
    pub fn settings(&self) -> ProbeSettings {
        ProbeSettings {
            burst_server: self.burst_server.clone(),
            throughput_server: self.throughput_server.clone(),
            echo_server: self.echo_server.clone(),
            ..ProbeSettings::default()
        }
    }
}

fn default_device_id() -> String {
    "auto".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_checkin_interval() -> u64 {
    MIN_CHECKIN_INTERVAL_SEC
}

fn default_min_retry() -> u64 {
    20
}

fn default_max_retry() -> u64 {
    60
}

fn default_max_retry_count() -> u32 {
    3
}

fn default_timeout() -> u64 {
    20
}

fn default_battery_threshold() -> u8 {
    DEFAULT_BATTERY_THRESHOLD
}

fn default_data_limit() -> String {
    DataUsageProfile::default().label().to_string()
}

fn default_period_days() -> u32 {
    DEFAULT_PERIOD_DAYS
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        
        Self::parse(&contents)
    }
    
    pub fn parse(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents)
            .with_context(|| "Failed to parse config file")?;
        
        if config.checkin.interval_sec < MIN_CHECKIN_INTERVAL_SEC {
            config.checkin.interval_sec = MIN_CHECKIN_INTERVAL_SEC;
        }
        if config.checkin.min_retry_interval_sec == 0 {
            config.checkin.min_retry_interval_sec = default_min_retry();
        }
        if config.checkin.max_retry_interval_sec < config.checkin.min_retry_interval_sec {
            config.checkin.max_retry_interval_sec = config.checkin.min_retry_interval_sec;
        }
        if config.resources.battery_threshold_pct > 100 {
            anyhow::bail!("battery_threshold_pct must be 0-100, got {}", config.resources.battery_threshold_pct);
        }
        config.resources.profile()?;
        
        Ok(config)
    }
    
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.general.data_dir)
    }
    
    /// Replace `auto` with the id stored in the data directory, generating
    /// and storing one on first start
    pub fn resolve_device_id(&mut self) -> Result<()> {
        if self.general.device_id != "auto" {
            return Ok(());
        }
        let path = self.data_dir().join(DEVICE_ID_FILE);
        let stored = std::fs::read_to_string(&path).ok();
        let id = match stored.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = generate_device_id();
                std::fs::write(&path, &id)
                    .with_context(|| format!("Failed to store device id in {:?}", path))?;
                info!("Generated device id {}", id);
                id
            }
        };
        self.general.device_id = id;
        Ok(())
    }
}

fn generate_device_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::parse(
            r#"
[checkin]
server_url = "http://localhost:8080"
"#,
        )
        .unwrap();
        
        assert_eq!(config.general.device_id, "auto");
        assert_eq!(config.checkin.interval_sec, 3600);
        assert_eq!(config.checkin.min_retry_interval_sec, 20);
        assert_eq!(config.checkin.max_retry_interval_sec, 60);
        assert_eq!(config.checkin.max_retry_count, 3);
        assert_eq!(config.resources.battery_threshold_pct, 60);
        assert_eq!(config.resources.profile().unwrap(), DataUsageProfile::Profile3);
        assert!(config.checkin.auth_cookie.is_none());
    }
    
    #[test]
    fn test_generated_device_id_is_kept() {
        let dir = tempfile::TempDir::new().unwrap();
        let contents = format!(
            "[general]\ndata_dir = {:?}\n\n[checkin]\nserver_url = \"http://x\"\n",
            dir.path().to_str().unwrap()
        );
        
        let mut first = Config::parse(&contents).unwrap();
        first.resolve_device_id().unwrap();
        assert_eq!(first.general.device_id.len(), 16);
        
        let mut second = Config::parse(&contents).unwrap();
        second.resolve_device_id().unwrap();
        assert_eq!(second.general.device_id, first.general.device_id);
    }
    
    #[test]
    fn test_checkin_interval_clamped() {
        let config = Config::parse(
            r#"
[general]
device_id = "abc"

[checkin]
server_url = "http://localhost:8080"
interval_sec = 60
"#,
        )
        .unwrap();
        assert_eq!(config.general.device_id, "abc");
        assert_eq!(config.checkin.interval_sec, MIN_CHECKIN_INTERVAL_SEC);
    }
    
    #[test]
    fn test_rejects_bad_values() {
        let bad_limit = r#"
[checkin]
server_url = "http://x"

[resources]
data_limit = "7 GB"
"#;
        assert!(Config::parse(bad_limit).is_err());
        
        let bad_threshold = r#"
[checkin]
server_url = "http://x"

[resources]
battery_threshold_pct = 150
"#;
        assert!(Config::parse(bad_threshold).is_err());
    }
    
    #[test]
    fn test_probe_settings_from_config() {
        let config = Config::parse(
            r#"
[checkin]
server_url = "http://x"

[probes]
burst_server = "10.0.0.1:31341"
"#,
        )
        .unwrap();
        let settings = config.probes.settings();
        assert_eq!(settings.burst_server.as_deref(), Some("10.0.0.1:31341"));
        assert!(settings.echo_server.is_none());
    }
}
