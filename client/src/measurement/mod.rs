//! Measurement model: descriptors, tasks, results and the probe registry

pub mod descriptor;
pub mod error;
pub mod kind;
pub mod registry;
pub mod result;
pub mod task;

pub use descriptor::MeasurementDescriptor;
pub use error::{MeasurementError, SkipReason};
pub use kind::MeasurementKind;
pub use registry::ProbeRegistry;
pub use result::MeasurementResult;
pub use task::{MeasurementTask, Probe, ProbeValues, TaskContext, TaskId};
