//! Task execution
//!
//! [`TaskRunner`] wraps a single measurement run: the power-aware admission
//! checks for system tasks, data-usage accounting, start/end notifications
//! and the "currently running" marker. [`executor::Executor`] feeds it one
//! task at a time.

pub mod executor;

pub use executor::{ExecutionHandle, Executor, TaskOutcome};

use crate::device::NetworkType;
use crate::measurement::{MeasurementError, MeasurementKind, MeasurementTask, SkipReason, TaskContext, TaskId};
use crate::output::{self, AgentEvent, EventSink};
use crate::resource::{ResourceCapManager, PHONE_UTIL_COST};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a task is admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Runs regardless of pause, battery and data budget, and is not charged
    User,
    /// Subject to pause, battery and data-limit checks
    PowerAware,
}

impl RunMode {
    pub fn for_task(task: &MeasurementTask) -> Self {
        if task.descriptor().is_user_task() {
            RunMode::User
        } else {
            RunMode::PowerAware
        }
    }
}

/// The task holding the run marker
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentTask {
    pub id: TaskId,
    pub key: Option<String>,
    pub kind: MeasurementKind,
}

pub struct TaskRunner {
    ctx: TaskContext,
    resources: Arc<ResourceCapManager>,
    events: EventSink,
    paused: Arc<AtomicBool>,
    current: Mutex<Option<CurrentTask>>,
}

/// Holds the run marker for the duration of one measurement
struct RunGuard<'a> {
    slot: &'a Mutex<Option<CurrentTask>>,
}

impl<'a> RunGuard<'a> {
    fn acquire(slot: &'a Mutex<Option<CurrentTask>>, task: &MeasurementTask) -> Self {
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(CurrentTask {
            id: task.id(),
            key: task.key().map(str::to_string),
            kind: task.descriptor().kind,
        });
        Self { slot }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl TaskRunner {
    pub fn new(
        ctx: TaskContext,
        resources: Arc<ResourceCapManager>,
        events: EventSink,
        paused: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ctx,
            resources,
            events,
            paused,
            current: Mutex::new(None),
        }
    }
    
    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }
    
    pub fn current_task(&self) -> Option<CurrentTask> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
    
    /// Network the measurement itself needs, whoever asked for it
    fn network_requirement(&self, task: &MeasurementTask) -> Option<SkipReason> {
        // Radio state inference only means something on cellular
        if task.descriptor().kind == MeasurementKind::Rrc && self.ctx.device.network_type() != NetworkType::Mobile {
            return Some(SkipReason::UnwantedNetwork);
        }
        None
    }
    
    /// Why a system task may not run right now
    fn admission(&self, task: &MeasurementTask) -> Option<SkipReason> {
        if self.paused.load(Ordering::SeqCst) {
            return Some(SkipReason::Paused);
        }
        if !self.resources.can_schedule_experiment() {
            return Some(SkipReason::LowBattery);
        }
        if self.ctx.device.network_type().is_metered() {
            match self.resources.is_over_data_limit(task.descriptor().kind) {
                Ok(true) => return Some(SkipReason::OverDataLimit),
                Ok(false) => {}
                Err(e) => warn!("Data usage check failed, continuing: {}", e),
            }
        }
        None
    }
    
    fn charge(&self, bytes: u64) {
        if let Err(e) = self.resources.update_data_usage(bytes) {
            warn!("Failed to record data usage: {}", e);
        }
    }
    
    /// Run one task to completion or cancellation
    pub async fn run(&self, task: &MeasurementTask, mode: RunMode, cancel: &CancellationToken) -> TaskOutcome {
        let descriptor = task.descriptor();
        
        let skip = match mode {
            RunMode::PowerAware => self.admission(task).or_else(|| self.network_requirement(task)),
            RunMode::User => self.network_requirement(task),
        };
        if let Some(reason) = skip {
            info!("Skipping {} ({:?}): {}", descriptor.kind, task.key(), reason);
            return Err(MeasurementError::Skipped(reason));
        }
        let charged = mode == RunMode::PowerAware;
        
        let _guard = RunGuard::acquire(&self.current, task);
        output::emit(
            &self.events,
            AgentEvent::MeasurementStarted {
                key: descriptor.key.clone(),
                kind: descriptor.kind,
                priority: descriptor.priority,
            },
        );
        output::status(&self.events, format!("Running {}", descriptor.kind.display_name()));
        info!("Running {} ({:?}, priority {})", descriptor.kind, task.key(), descriptor.priority);
        
        if charged {
            self.charge(PHONE_UTIL_COST);
        }
        
        let outcome = tokio::select! {
            outcome = task.call(&self.ctx) => outcome,
            _ = cancel.cancelled() => {
                task.stop();
                Err(MeasurementError::Cancelled)
            }
        };
        
        if charged && self.ctx.device.network_type().is_metered() {
            let consumed = task.data_consumed();
            debug!("{} consumed {} bytes on metered network", descriptor.kind, consumed);
            self.charge(consumed);
        }
        
        if !matches!(outcome, Err(MeasurementError::Skipped(_))) {
            output::emit(
                &self.events,
                AgentEvent::MeasurementEnded {
                    key: descriptor.key.clone(),
                    kind: descriptor.kind,
                    priority: descriptor.priority,
                    user: descriptor.is_user_task(),
                    outcome: match &outcome {
                        Ok(result) => Ok(result.render()),
                        Err(e) => Err(e.to_string()),
                    },
                },
            );
        }
        output::status(&self.events, "Done running");
        
        outcome
    }
}
