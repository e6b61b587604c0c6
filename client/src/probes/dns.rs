//! DNS lookup through the system resolver

use super::{ProbeControl, ProbeSettings};
use crate::measurement::{MeasurementDescriptor, MeasurementError, Probe, ProbeValues};
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, info};

/// Typical bytes for one query and its answer
pub const AVG_DATA_USAGE_BYTES: u64 = 2000;

pub struct DnsLookupProbe {
    target: String,
    control: ProbeControl,
}

impl DnsLookupProbe {
    pub fn new(descriptor: &MeasurementDescriptor, _settings: &ProbeSettings) -> Result<Self, MeasurementError> {
        let target = descriptor.require_param("target")?.to_string();
        if let Some(server) = descriptor.param("server") {
            debug!("Ignoring resolver override {}; using the system resolver", server);
        }
        Ok(Self {
            target,
            control: ProbeControl::new(),
        })
    }
}

#[async_trait]
impl Probe for DnsLookupProbe {
    async fn run(&self) -> Result<ProbeValues, MeasurementError> {
        self.control.check()?;
        info!("Running DNS lookup for {}", self.target);
        
        let started = Instant::now();
        let lookup = tokio::net::lookup_host((self.target.as_str(), 0));
        let addrs = self
            .control
            .guard(lookup)
            .await?
            .map_err(|e| MeasurementError::failed(format!("Cannot resolve domain name {}: {}", self.target, e)))?;
        let elapsed = started.elapsed();
        self.control.add_bytes(AVG_DATA_USAGE_BYTES);
        
        let addr = addrs
            .map(|a| a.ip())
            .next()
            .ok_or_else(|| MeasurementError::failed(format!("Cannot resolve domain name {}", self.target)))?;
        
        let mut values = ProbeValues::new();
        values.insert("address".into(), addr.to_string());
        values.insert("real_hostname".into(), self.target.clone());
        values.insert("time_ms".into(), elapsed.as_millis().to_string());
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
    
    #[tokio::test]
    async fn test_resolves_localhost() {
        let d = MeasurementDescriptor::builder(MeasurementKind::DnsLookup)
            .param("target", "localhost")
            .build(Utc::now());
        let probe = DnsLookupProbe::new(&d, &ProbeSettings::default()).unwrap();
        
        let values = probe.run().await.unwrap();
        let addr: std::net::IpAddr = values["address"].parse().unwrap();
        assert!(addr.is_loopback());
        assert_eq!(values["real_hostname"], "localhost");
        assert_eq!(probe.data_consumed(), AVG_DATA_USAGE_BYTES);
    }
}
