//! Fakes shared by unit tests

use crate::device::{DeviceInfoProvider, NetworkType};
use crate::measurement::{MeasurementError, MeasurementKind, Probe, ProbeRegistry, ProbeValues};
use crate::probes::ProbeSettings;
use async_trait::async_trait;
use protocol::wire::{DeviceInfo, DeviceProperty};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
struct DeviceState {
    battery: u8,
    charging: bool,
    network: NetworkType,
}

/// Device whose battery and network are set by the test
pub struct StaticDeviceInfo {
    state: Mutex<DeviceState>,
}

impl StaticDeviceInfo {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState {
                battery: 100,
                charging: false,
                network: NetworkType::Wifi,
            }),
        }
    }
    
    pub fn set_battery(&self, battery: u8, charging: bool) {
        let mut state = self.state.lock().unwrap();
        state.battery = battery;
        state.charging = charging;
    }
    
    pub fn set_network(&self, network: NetworkType) {
        self.state.lock().unwrap().network = network;
    }
}

impl DeviceInfoProvider for StaticDeviceInfo {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: "test-device".into(),
            manufacturer: "acme".into(),
            model: "bench".into(),
            os: "linux".into(),
        }
    }
    
    fn device_property(&self) -> DeviceProperty {
        let state = *self.state.lock().unwrap();
        DeviceProperty {
            device_id: "test-device".into(),
            app_version: "test".into(),
            network_type: state.network.to_string(),
            battery_level: state.battery,
            is_battery_charging: state.charging,
            ..Default::default()
        }
    }
    
    fn battery_level(&self) -> u8 {
        self.state.lock().unwrap().battery
    }
    
    fn is_charging(&self) -> bool {
        self.state.lock().unwrap().charging
    }
    
    fn network_type(&self) -> NetworkType {
        self.state.lock().unwrap().network
    }
}

/// Order in which fake probes ran, by task key
pub type ProbeLog = Arc<Mutex<Vec<String>>>;

pub struct FakeProbe {
    outcome: Result<ProbeValues, MeasurementError>,
    delay: Duration,
    bytes: u64,
    consumed: AtomicU64,
    log: Option<(ProbeLog, String)>,
    cancel: CancellationToken,
    pub stopped: AtomicBool,
}

impl FakeProbe {
    pub fn succeeding() -> Self {
        let mut values = ProbeValues::new();
        values.insert("ok".into(), "true".into());
        Self::with_outcome(Ok(values))
    }
    
    pub fn failing(msg: &str) -> Self {
        Self::with_outcome(Err(MeasurementError::failed(msg)))
    }
    
    fn with_outcome(outcome: Result<ProbeValues, MeasurementError>) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            bytes: 0,
            consumed: AtomicU64::new(0),
            log: None,
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }
    
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
    
    pub fn bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }
    
    pub fn recording(mut self, log: ProbeLog, label: impl Into<String>) -> Self {
        self.log = Some((log, label.into()));
        self
    }
}

#[async_trait]
impl Probe for FakeProbe {
    async fn run(&self) -> Result<ProbeValues, MeasurementError> {
        if let Some((log, label)) = &self.log {
            log.lock().unwrap().push(label.clone());
        }
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = self.cancel.cancelled() => return Err(MeasurementError::Cancelled),
        }
        self.consumed.store(self.bytes, Ordering::SeqCst);
        self.outcome.clone()
    }
    
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
    
    fn data_consumed(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }
}

/// Registry where every kind runs a recording fake. Parameters `fail`
/// (error text), `delay_ms` and `bytes` shape the fake's behaviour.
pub fn recording_registry(log: ProbeLog) -> ProbeRegistry {
    let mut registry = ProbeRegistry::new(ProbeSettings::default());
    for kind in MeasurementKind::ALL {
        let log = log.clone();
        registry.register_fn(kind, move |d, _| {
            let label = d.key.clone().unwrap_or_else(|| d.kind.tag().to_string());
            let probe = match d.param("fail") {
                Some(msg) => FakeProbe::failing(msg),
                None => FakeProbe::succeeding(),
            };
            let probe = probe
                .delay(Duration::from_millis(d.param_or("delay_ms", 0u64)?))
                .bytes(d.param_or("bytes", 0u64)?)
                .recording(log.clone(), label);
            Ok(Arc::new(probe) as Arc<dyn Probe>)
        });
    }
    registry
}
