//! Server configuration

use anyhow::{Context, Result};
use protocol::{
    DEFAULT_BURST_PORT, DEFAULT_ECHO_PORT, MAX_BURST_COUNT, MAX_PACKET_SIZE, MIN_PACKET_SIZE,
    THROUGHPUT_CONFIG_PORT, THROUGHPUT_DOWN_PORT, THROUGHPUT_UP_PORT,
};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_burst_port")]
    pub burst_port: u16,
    #[serde(default = "default_echo_port")]
    pub echo_port: u16,
    #[serde(default = "default_down_port")]
    pub throughput_down_port: u16,
    #[serde(default = "default_up_port")]
    pub throughput_up_port: u16,
    #[serde(default = "default_config_port")]
    pub throughput_config_port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            burst_port: default_burst_port(),
            echo_port: default_echo_port(),
            throughput_down_port: default_down_port(),
            throughput_up_port: default_up_port(),
            throughput_config_port: default_config_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_burst_count")]
    pub max_burst_count: i32,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Downlink send time after slow start
    #[serde(default = "default_throughput_duration")]
    pub throughput_duration_sec: u64,
    #[serde(default = "default_slow_start")]
    pub slow_start_sec: u64,
    #[serde(default = "default_sample_period")]
    pub sample_period_ms: u64,
    /// Idle time after which a partial uplink burst is answered anyway
    #[serde(default = "default_burst_idle")]
    pub burst_idle_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_burst_count: default_max_burst_count(),
            max_packet_size: default_max_packet_size(),
            throughput_duration_sec: default_throughput_duration(),
            slow_start_sec: default_slow_start(),
            sample_period_ms: default_sample_period(),
            burst_idle_ms: default_burst_idle(),
        }
    }
}

impl LimitsConfig {
    pub fn throughput_duration(&self) -> Duration {
        Duration::from_secs(self.throughput_duration_sec)
    }
    
    pub fn slow_start(&self) -> Duration {
        Duration::from_secs(self.slow_start_sec)
    }
    
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }
    
    pub fn burst_idle(&self) -> Duration {
        Duration::from_millis(self.burst_idle_ms)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_burst_port() -> u16 {
    DEFAULT_BURST_PORT
}

fn default_echo_port() -> u16 {
    DEFAULT_ECHO_PORT
}

fn default_down_port() -> u16 {
    THROUGHPUT_DOWN_PORT
}

fn default_up_port() -> u16 {
    THROUGHPUT_UP_PORT
}

fn default_config_port() -> u16 {
    THROUGHPUT_CONFIG_PORT
}

fn default_max_burst_count() -> i32 {
    MAX_BURST_COUNT
}

fn default_max_packet_size() -> usize {
    MAX_PACKET_SIZE
}

fn default_throughput_duration() -> u64 {
    15
}

fn default_slow_start() -> u64 {
    5
}

fn default_sample_period() -> u64 {
    1000
}

fn default_burst_idle() -> u64 {
    2000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context("Failed to read config file")?;
        
        Self::parse(&content)
    }
    
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .context("Failed to parse config file")?;
        
        let limits = &config.limits;
        if limits.max_burst_count < 1 || limits.max_burst_count > MAX_BURST_COUNT {
            anyhow::bail!("max_burst_count must be 1-{}, got {}", MAX_BURST_COUNT, limits.max_burst_count);
        }
        if limits.max_packet_size < MIN_PACKET_SIZE || limits.max_packet_size > MAX_PACKET_SIZE {
            anyhow::bail!(
                "max_packet_size must be {}-{}, got {}",
                MIN_PACKET_SIZE,
                MAX_PACKET_SIZE,
                limits.max_packet_size
            );
        }
        if limits.sample_period_ms == 0 {
            anyhow::bail!("sample_period_ms must be positive");
        }
        
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_empty_config_uses_protocol_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.general.burst_port, DEFAULT_BURST_PORT);
        assert_eq!(config.general.echo_port, DEFAULT_ECHO_PORT);
        assert_eq!(config.general.throughput_config_port, THROUGHPUT_CONFIG_PORT);
        assert_eq!(config.limits.max_burst_count, MAX_BURST_COUNT);
        assert_eq!(config.limits.throughput_duration(), Duration::from_secs(15));
    }
    
    #[test]
    fn test_limits_validated() {
        let too_many = r#"
[limits]
max_burst_count = 500
"#;
        assert!(Config::parse(too_many).is_err());
        
        let too_small = r#"
[limits]
max_packet_size = 10
"#;
        assert!(Config::parse(too_small).is_err());
        
        let ok = r#"
[general]
bind_address = "127.0.0.1"
burst_port = 4000

[limits]
max_burst_count = 20
"#;
        let config = Config::parse(ok).unwrap();
        assert_eq!(config.general.bind_address, "127.0.0.1");
        assert_eq!(config.general.burst_port, 4000);
        assert_eq!(config.limits.max_burst_count, 20);
    }
}
