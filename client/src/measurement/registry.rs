//! Probe registry
//!
//! Maps each [`MeasurementKind`] to the constructor that builds its probe.
//! Populated once at startup; schedule entries naming a kind with no
//! registered constructor fail with a typed error.

use super::descriptor::MeasurementDescriptor;
use super::error::MeasurementError;
use super::kind::MeasurementKind;
use super::task::{MeasurementTask, Probe, ProbeFactory};
use crate::probes::{self, ProbeSettings};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ProbeRegistry {
    factories: HashMap<MeasurementKind, ProbeFactory>,
    settings: Arc<ProbeSettings>,
}

impl ProbeRegistry {
    pub fn new(settings: ProbeSettings) -> Self {
        Self {
            factories: HashMap::new(),
            settings: Arc::new(settings),
        }
    }
    
    /// Registry with every built-in probe
    pub fn with_builtin_probes(settings: ProbeSettings) -> Self {
        let mut registry = Self::new(settings);
        registry.register_fn(MeasurementKind::Ping, |d, s| shared(probes::ping::PingProbe::new(d, s)));
        registry.register_fn(MeasurementKind::Traceroute, |d, s| {
            shared(probes::traceroute::TracerouteProbe::new(d, s))
        });
        registry.register_fn(MeasurementKind::DnsLookup, |d, s| shared(probes::dns::DnsLookupProbe::new(d, s)));
        registry.register_fn(MeasurementKind::Http, |d, s| shared(probes::http::HttpProbe::new(d, s)));
        registry.register_fn(MeasurementKind::UdpBurst, |d, s| {
            shared(probes::udp_burst::UdpBurstProbe::new(d, s))
        });
        registry.register_fn(MeasurementKind::TcpThroughput, |d, s| {
            shared(probes::tcp_throughput::TcpThroughputProbe::new(d, s))
        });
        registry.register_fn(MeasurementKind::Rrc, |d, s| shared(probes::rrc::RrcProbe::new(d, s)));
        registry
    }
    
    pub fn register(&mut self, kind: MeasurementKind, factory: ProbeFactory) {
        self.factories.insert(kind, factory);
    }
    
    pub fn register_fn<F>(&mut self, kind: MeasurementKind, factory: F)
    where
        F: Fn(&MeasurementDescriptor, &ProbeSettings) -> Result<Arc<dyn Probe>, MeasurementError>
            + Send
            + Sync
            + 'static,
    {
        self.register(kind, Arc::new(factory));
    }
    
    pub fn create_task(&self, descriptor: MeasurementDescriptor) -> Result<MeasurementTask, MeasurementError> {
        let factory = self
            .factories
            .get(&descriptor.kind)
            .ok_or_else(|| MeasurementError::UnknownMeasurementType(descriptor.kind.tag().to_string()))?;
        MeasurementTask::new(descriptor, factory.clone(), self.settings.clone())
    }
}

fn shared<P: Probe + 'static>(probe: Result<P, MeasurementError>) -> Result<Arc<dyn Probe>, MeasurementError> {
    Ok(Arc::new(probe?))
}
