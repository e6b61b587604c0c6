//! Executable measurement tasks

use super::descriptor::MeasurementDescriptor;
use super::error::MeasurementError;
use super::result::MeasurementResult;
use crate::clock::SharedClock;
use crate::device::DeviceInfoProvider;
use crate::probes::ProbeSettings;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tracing::warn;

/// Result values produced by a probe, keyed by result name
pub type ProbeValues = BTreeMap<String, String>;

/// Probe-specific measurement body
#[async_trait]
pub trait Probe: Send + Sync {
    /// Run to completion
    async fn run(&self) -> Result<ProbeValues, MeasurementError>;
    
    /// Best-effort cancellation; idempotent, safe when not running
    fn stop(&self);
    
    /// Bytes sent plus received so far
    fn data_consumed(&self) -> u64;
}

/// Constructor registered per probe kind; validates parameters
pub type ProbeFactory = Arc<
    dyn Fn(&MeasurementDescriptor, &ProbeSettings) -> Result<Arc<dyn Probe>, MeasurementError>
        + Send
        + Sync,
>;

/// Collaborators a task needs to turn probe output into a result
#[derive(Clone)]
pub struct TaskContext {
    pub device: Arc<dyn DeviceInfoProvider>,
    pub clock: SharedClock,
}

pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub struct MeasurementTask {
    id: TaskId,
    descriptor: MeasurementDescriptor,
    probe: Arc<dyn Probe>,
    factory: ProbeFactory,
    settings: Arc<ProbeSettings>,
}

impl MeasurementTask {
    pub fn new(
        descriptor: MeasurementDescriptor,
        factory: ProbeFactory,
        settings: Arc<ProbeSettings>,
    ) -> Result<Self, MeasurementError> {
        let probe = factory(&descriptor, &settings)?;
        Ok(Self {
            id: NEXT_TASK_ID.fetch_add(1, AtomicOrdering::Relaxed),
            descriptor,
            probe,
            factory,
            settings,
        })
    }
    
    pub fn id(&self) -> TaskId {
        self.id
    }
    
    pub fn descriptor(&self) -> &MeasurementDescriptor {
        &self.descriptor
    }
    
    pub fn key(&self) -> Option<&str> {
        self.descriptor.key.as_deref()
    }
    
    /// Run the probe and wrap its output into a result
    pub async fn call(&self, ctx: &TaskContext) -> Result<MeasurementResult, MeasurementError> {
        let values = self.probe.run().await?;
        let info = ctx.device.device_info();
        let mut result = MeasurementResult::new(
            info.device_id,
            ctx.device.device_property(),
            self.descriptor.clone(),
            ctx.clock.now(),
            true,
        );
        result.values.extend(values);
        Ok(result)
    }
    
    pub fn stop(&self) {
        self.probe.stop();
    }
    
    pub fn data_consumed(&self) -> u64 {
        self.probe.data_consumed()
    }
    
    /// Task for the next recurrence, with a fresh probe instance
    pub fn next_recurrence(&self) -> Option<MeasurementTask> {
        let descriptor = self.descriptor.next_recurrence()?;
        match MeasurementTask::new(descriptor, self.factory.clone(), self.settings.clone()) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!("Failed to clone task {:?}: {}", self.key(), e);
                None
            }
        }
    }
    
    /// Queue order: priority, then start time. `None` when either side
    /// carries the invalid priority and cannot be ordered.
    pub fn compare(&self, other: &MeasurementTask) -> Option<Ordering> {
        use super::descriptor::INVALID_PRIORITY;
        if self.descriptor.priority == INVALID_PRIORITY || other.descriptor.priority == INVALID_PRIORITY {
            return None;
        }
        Some(
            self.descriptor
                .priority
                .cmp(&other.descriptor.priority)
                .then(self.descriptor.start_time.cmp(&other.descriptor.start_time)),
        )
    }
}

impl fmt::Debug for MeasurementTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementTask")
            .field("id", &self.id)
            .field("kind", &self.descriptor.kind)
            .field("key", &self.descriptor.key)
            .field("priority", &self.descriptor.priority)
            .field("start_time", &self.descriptor.start_time)
            .finish()
    }
}
