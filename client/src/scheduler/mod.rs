//! Measurement scheduler
//!
//! One actor task owns the queue, the pending set, the database and the
//! checkin state; everything else talks to it through [`SchedulerHandle`].
//! Three timers drive it: the next-measurement wakeup, the periodic checkin
//! and the checkin retry. Finished executions wake it through the
//! executor's completion channel. The network half of a checkin runs in its
//! own task and reports back on a channel, so dispatch never waits on HTTP.

use crate::checkin::{CheckinClient, CheckinError, RetryPolicy, RetryState, RRC_INFERENCE_PATH};
use crate::config::{Config, MIN_CHECKIN_INTERVAL_SEC};
use crate::measurement::{
    MeasurementDescriptor, MeasurementError, MeasurementKind, MeasurementResult, ProbeRegistry, TaskContext, TaskId,
};
use crate::output::{self, EventSink, ResultConsole};
use crate::queue::{AdmissionRejected, Collected, CollectedTask, PendingEntry, PendingSet, QueuedSummary, TaskQueue};
use crate::resource::{DataUsageProfile, ResourceCapManager, ResourceError, PHONE_UTIL_COST};
use crate::runner::{CurrentTask, Executor, RunMode, TaskRunner};
use crate::storage::{Database, StoredResult, STAT_COMPLETED, STAT_FAILED};
use chrono::{DateTime, Utc};
use protocol::wire::{WireResult, WireTaskDescriptor};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Floor on the delay between two measurement wakeups
pub const MIN_TIME_BETWEEN_MEASUREMENT_ALARM: Duration = Duration::from_secs(3);

const COMMAND_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Measurement(#[from] MeasurementError),
    
    #[error("Task rejected: {0}")]
    Rejected(#[from] AdmissionRejected),
    
    #[error(transparent)]
    Resource(#[from] ResourceError),
    
    #[error("Scheduler has stopped")]
    Stopped,
}

/// Runtime preference changes; `None` leaves a setting alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preferences {
    pub battery_threshold: Option<i64>,
    pub checkin_interval_sec: Option<u64>,
    pub data_limit: Option<DataUsageProfile>,
}

#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub queued: Vec<QueuedSummary>,
    pub pending: usize,
    pub current: Option<CurrentTask>,
    pub paused: bool,
    pub last_checkin: Option<DateTime<Utc>>,
    pub next_checkin: Option<DateTime<Utc>>,
    pub completed: u64,
    pub failed: u64,
    pub battery_threshold: u8,
    /// Bytes charged in the current data period; `None` before any use
    pub data_used_bytes: Option<i64>,
    pub awaiting_upload: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub checkin_interval: Duration,
    pub retry: RetryPolicy,
    pub start_paused: bool,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            checkin_interval: Duration::from_secs(config.checkin.interval_sec),
            retry: RetryPolicy {
                min_interval: Duration::from_secs(config.checkin.min_retry_interval_sec),
                max_interval: Duration::from_secs(config.checkin.max_retry_interval_sec),
                max_count: config.checkin.max_retry_count,
            },
            start_paused: config.general.start_paused,
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Completed(TaskId),
    CheckinDone(CheckinOutcome),
    Measurement,
    Checkin,
    Retry,
}

type SideUpload = (String, serde_json::Value);

/// What one checkin exchange takes off the actor
struct CheckinJob {
    results: Vec<StoredResult>,
    side_uploads: Vec<SideUpload>,
    fetch_schedule: bool,
}

/// What comes back once the exchange is over
struct CheckinOutcome {
    /// Stored result ids the server acknowledged
    uploaded: Vec<i64>,
    /// Side-channel documents to try again next time
    undelivered: Vec<SideUpload>,
    /// `None` when the schedule download was skipped
    schedule: Result<Option<Vec<WireTaskDescriptor>>, CheckinError>,
}

enum Command {
    Submit(MeasurementDescriptor, oneshot::Sender<Result<TaskId, SchedulerError>>),
    RemoveByKey(String, oneshot::Sender<bool>),
    Pause,
    Resume,
    CheckinNow,
    UpdatePreferences(Preferences, oneshot::Sender<Result<(), SchedulerError>>),
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
    Stop(oneshot::Sender<()>),
}

/// Cloneable front door to a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    async fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.tx.send(command).await.map_err(|_| SchedulerError::Stopped)
    }
    
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }
    
    /// Queue a task; user-priority descriptors skip admission control
    pub async fn submit_task(&self, descriptor: MeasurementDescriptor) -> Result<TaskId, SchedulerError> {
        self.request(|tx| Command::Submit(descriptor, tx)).await?
    }
    
    pub async fn remove_task_by_key(&self, key: impl Into<String>) -> Result<bool, SchedulerError> {
        let key = key.into();
        self.request(|tx| Command::RemoveByKey(key, tx)).await
    }
    
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send(Command::Pause).await
    }
    
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send(Command::Resume).await
    }
    
    /// Check in now, ignoring pause and battery state
    pub async fn checkin_now(&self) -> Result<(), SchedulerError> {
        self.send(Command::CheckinNow).await
    }
    
    pub async fn update_preferences(&self, preferences: Preferences) -> Result<(), SchedulerError> {
        self.request(|tx| Command::UpdatePreferences(preferences, tx)).await?
    }
    
    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, SchedulerError> {
        self.request(Command::Snapshot).await
    }
    
    /// Cancel all work and wait for the scheduler to shut down. Irreversible.
    pub async fn request_stop(&self) -> Result<(), SchedulerError> {
        self.request(Command::Stop).await
    }
}

pub struct Scheduler {
    registry: ProbeRegistry,
    queue: TaskQueue,
    pending: PendingSet,
    runner: Arc<TaskRunner>,
    executor: Executor,
    worker: Option<JoinHandle<()>>,
    completions: mpsc::UnboundedReceiver<TaskId>,
    checkin: Arc<CheckinClient>,
    /// Exchange in flight, if any
    checkin_task: Option<JoinHandle<()>>,
    checkin_done_tx: mpsc::UnboundedSender<CheckinOutcome>,
    checkin_done: mpsc::UnboundedReceiver<CheckinOutcome>,
    db: Database,
    resources: Arc<ResourceCapManager>,
    ctx: TaskContext,
    events: EventSink,
    paused: Arc<AtomicBool>,
    retry: RetryState,
    checkin_interval: Duration,
    /// Current server schedule by task key
    schedule: HashMap<String, MeasurementDescriptor>,
    /// Side-channel documents waiting for the next checkin
    side_uploads: Vec<SideUpload>,
    next_measurement: Option<Instant>,
    next_checkin: Instant,
    retry_at: Option<Instant>,
    user_results: Arc<ResultConsole>,
    system_results: Arc<ResultConsole>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: ProbeRegistry,
        checkin: CheckinClient,
        db: Database,
        resources: Arc<ResourceCapManager>,
        ctx: TaskContext,
        events: EventSink,
    ) -> Self {
        let paused = Arc::new(AtomicBool::new(config.start_paused));
        let runner = Arc::new(TaskRunner::new(ctx.clone(), resources.clone(), events.clone(), paused.clone()));
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (executor, worker) = Executor::spawn(runner.clone(), completions_tx);
        let (checkin_done_tx, checkin_done) = mpsc::unbounded_channel();
        
        Self {
            registry,
            queue: TaskQueue::new(),
            pending: PendingSet::new(),
            runner,
            executor,
            worker: Some(worker),
            completions,
            checkin: Arc::new(checkin),
            checkin_task: None,
            checkin_done_tx,
            checkin_done,
            db,
            resources,
            ctx,
            events,
            paused,
            retry: RetryState::new(config.retry),
            checkin_interval: config.checkin_interval.max(Duration::from_secs(MIN_CHECKIN_INTERVAL_SEC)),
            schedule: HashMap::new(),
            side_uploads: Vec::new(),
            next_measurement: None,
            // First checkin right away
            next_checkin: Instant::now(),
            retry_at: None,
            user_results: Arc::new(ResultConsole::new()),
            system_results: Arc::new(ResultConsole::new()),
        }
    }
    
    /// Rendered results of user tasks, newest first
    pub fn user_results(&self) -> Arc<ResultConsole> {
        self.user_results.clone()
    }
    
    /// Rendered results of server tasks, newest first
    pub fn system_results(&self) -> Arc<ResultConsole> {
        self.system_results.clone()
    }
    
    fn now(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }
    
    /// Reload the persisted server schedule. Start times in the past move
    /// to the next occurrence on their interval grid; expired entries are
    /// dropped.
    pub fn restore(&mut self) {
        let saved = match self.db.load_schedule() {
            Ok(saved) => saved,
            Err(e) => {
                error!("Failed to load saved schedule: {}", e);
                return;
            }
        };
        let now = self.now();
        let mut restored = Vec::new();
        for wire in saved {
            let mut descriptor = match MeasurementDescriptor::from_wire(&wire, now) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Dropping saved task {:?}: {}", wire.key, e);
                    continue;
                }
            };
            if descriptor.start_time < now {
                let interval_ms = descriptor.interval().num_milliseconds().max(1);
                let behind_ms = (now - descriptor.start_time).num_milliseconds();
                let steps = (behind_ms + interval_ms - 1) / interval_ms;
                descriptor.start_time += chrono::Duration::milliseconds(steps * interval_ms);
            }
            if descriptor.is_passed_deadline(descriptor.start_time) {
                debug!("Saved task {:?} has expired", descriptor.key);
                continue;
            }
            restored.push(descriptor);
        }
        info!("Restored {} scheduled tasks", restored.len());
        self.apply_schedule(restored, false);
    }
    
    pub fn submit_task(&self, descriptor: MeasurementDescriptor) -> Result<TaskId, SchedulerError> {
        let task = self.registry.create_task(descriptor)?;
        let id = task.id();
        self.queue.submit(task, self.pending.len())?;
        Ok(id)
    }
    
    /// Remove one queued task; running tasks are not affected
    pub fn remove_task_by_key(&self, key: &str) -> bool {
        self.queue.remove_by_key(key).is_some()
    }
    
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        output::status(&self.events, "Paused");
        info!("Scheduler paused");
    }
    
    pub fn resume(&mut self) {
        self.paused.store(false, Ordering::SeqCst);
        output::status(&self.events, "Resumed");
        info!("Scheduler resumed");
        self.handle_measurement();
    }
    
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
    
    /// Start due tasks once the executor is free and re-arm the wakeup.
    /// Tasks already past their deadline go straight to the pending set
    /// as deadline failures.
    pub fn handle_measurement(&mut self) {
        let now = self.now();
        while self.executor.is_idle() {
            let Some(task) = self.queue.pop_due(now) else {
                break;
            };
            info!("Processing task {:?}", task);
            if let Some(next) = task.next_recurrence() {
                if let Err(e) = self.queue.submit(next, self.pending.len()) {
                    warn!("Could not queue next run of {:?}: {}", task.key(), e);
                }
            }
            
            let descriptor = task.descriptor().clone();
            if descriptor.is_passed_deadline(now) {
                warn!("Task {:?} passed its deadline before execution", task.key());
                self.pending.insert(task.id(), PendingEntry { descriptor, handle: None });
                continue;
            }
            
            let mode = RunMode::for_task(&task);
            match mode {
                RunMode::User => output::status(&self.events, format!("Scheduling user task: {}", descriptor.kind)),
                RunMode::PowerAware => output::status(&self.events, format!("Scheduling task: {}", descriptor.kind)),
            }
            let id = task.id();
            let handle = self.executor.submit(task, mode);
            self.pending.insert(id, PendingEntry { descriptor, handle: Some(handle) });
        }
        
        self.next_measurement = self.queue.head_time_from_execution(now).map(|ms| {
            let delay = Duration::from_millis(ms.max(0) as u64).max(MIN_TIME_BETWEEN_MEASUREMENT_ALARM);
            Instant::now() + delay
        });
    }
    
    fn failure_result(&self, descriptor: MeasurementDescriptor, error: &str) -> MeasurementResult {
        if let Err(e) = self.resources.update_data_usage(PHONE_UTIL_COST) {
            warn!("Failed to record data usage: {}", e);
        }
        MeasurementResult::failure(
            self.ctx.device.device_info().device_id,
            self.ctx.device.device_property(),
            descriptor,
            self.now(),
            error,
        )
    }
    
    fn bump_stat(&self, name: &str) {
        if let Err(e) = self.db.increment_stat(name) {
            warn!("Failed to update {} counter: {}", name, e);
        }
    }
    
    fn record(&mut self, result: &MeasurementResult, user: bool) {
        let console = if user { &self.user_results } else { &self.system_results };
        console.push(result.render());
        if result.success {
            self.bump_stat(STAT_COMPLETED);
        } else {
            self.bump_stat(STAT_FAILED);
        }
        // Failures are reported for server tasks only
        if user && !result.success {
            return;
        }
        if let Err(e) = self.db.store_result(&result.to_wire()) {
            error!("Failed to store result for {:?}: {}", result.task_key(), e);
        }
        if result.success && result.kind() == MeasurementKind::Rrc && result.descriptor.param("upload") == Some("true") {
            self.side_uploads.push((RRC_INFERENCE_PATH.to_string(), rrc_document(result)));
        }
    }
    
    /// Move finished pending entries into results. Skips are dropped
    /// silently.
    pub fn collect_finished(&mut self) {
        let now = self.now();
        for CollectedTask { descriptor, outcome } in self.pending.collect(now) {
            let user = descriptor.is_user_task();
            let result = match outcome {
                Collected::Finished(result) => result,
                Collected::Skipped => {
                    debug!("Task {:?} was skipped", descriptor.key);
                    continue;
                }
                Collected::Failed(e) => self.failure_result(descriptor, &e.to_string()),
                Collected::Cancelled => self.failure_result(descriptor, "Task cancelled"),
                Collected::DeadlinePassed => self.failure_result(descriptor, "Deadline passed before execution"),
            };
            self.record(&result, user);
        }
    }
    
    /// Periodic or forced checkin. Returns false when no exchange was
    /// started. The outcome arrives later through [`Self::finish_checkin`].
    pub fn handle_checkin(&mut self, force: bool) -> bool {
        if self.checkin_task.is_some() {
            debug!("Checkin already in progress");
            return false;
        }
        if !force && self.is_paused() {
            output::status(&self.events, "Skipping checkin - app is paused");
            info!("Skipping checkin - app is paused");
            return false;
        }
        if !force && !self.resources.can_schedule_experiment() {
            output::status(&self.events, "Skipping checkin - below battery threshold");
            info!("Skipping checkin - below battery threshold");
            return false;
        }
        
        output::status(&self.events, "checking in...");
        self.checkin.prepare();
        self.collect_finished();
        
        let results = self.db.pending_results().unwrap_or_else(|e| {
            warn!("Failed to read stored results, uploading none: {}", e);
            Vec::new()
        });
        let fetch_schedule = !self.runner.current_task().is_some_and(|t| t.kind == MeasurementKind::Rrc);
        if !fetch_schedule {
            info!("RRC inference running, not downloading tasks");
        }
        let job = CheckinJob {
            results,
            side_uploads: std::mem::take(&mut self.side_uploads),
            fetch_schedule,
        };
        
        let client = self.checkin.clone();
        let done = self.checkin_done_tx.clone();
        self.checkin_task = Some(tokio::spawn(async move {
            let outcome = exchange(&client, job).await;
            let _ = done.send(outcome);
        }));
        true
    }
    
    /// Apply a finished exchange: drop acknowledged results, reconcile the
    /// schedule and settle the retry timer
    fn finish_checkin(&mut self, outcome: CheckinOutcome) {
        self.checkin_task = None;
        if !outcome.uploaded.is_empty() {
            if let Err(e) = self.db.delete_results(&outcome.uploaded) {
                error!("Failed to delete uploaded results: {}", e);
            }
        }
        self.side_uploads.extend(outcome.undelivered);
        
        match outcome.schedule {
            Ok(schedule) => {
                if let Some(schedule) = schedule {
                    self.update_schedule(schedule);
                }
                self.retry.reset();
                self.retry_at = None;
            }
            Err(e) => {
                error!("Checkin attempt {} failed: {}", self.retry.count() + 1, e);
                self.retry_at = self
                    .retry
                    .on_failure(self.checkin_interval)
                    .map(|delay| Instant::now() + delay);
            }
        }
        self.handle_measurement();
    }
    
    /// Reconcile a fresh server schedule with the current one
    pub fn update_schedule(&mut self, schedule: Vec<WireTaskDescriptor>) {
        let now = self.now();
        let profile = self.resources.data_profile();
        let mut descriptors = Vec::new();
        for wire in schedule {
            let mut descriptor = match MeasurementDescriptor::from_wire(&wire, now) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Ignoring task {:?}: {}", wire.key, e);
                    continue;
                }
            };
            if descriptor.key.is_none() {
                descriptor.key = Some(synthesize_key(&descriptor));
            }
            if adjust_interval(&mut descriptor, profile, now) {
                descriptors.push(descriptor);
            }
        }
        self.apply_schedule(descriptors, true);
    }
    
    fn apply_schedule(&mut self, descriptors: Vec<MeasurementDescriptor>, persist: bool) {
        let mut missing: HashSet<String> = self.schedule.keys().cloned().collect();
        let mut to_remove = HashSet::new();
        let mut to_add = Vec::new();
        
        for descriptor in descriptors {
            let key = descriptor.key.clone().unwrap_or_else(|| synthesize_key(&descriptor));
            match self.schedule.get(&key) {
                None => to_add.push(descriptor),
                Some(current) => {
                    if *current != descriptor {
                        to_remove.insert(key.clone());
                        to_add.push(descriptor);
                    }
                    missing.remove(&key);
                }
            }
        }
        to_remove.extend(missing);
        
        info!("Schedule update: {} to remove, {} to add", to_remove.len(), to_add.len());
        for key in &to_remove {
            while self.queue.remove_by_key(key).is_some() {
                debug!("Removed task {}", key);
            }
            self.schedule.remove(key);
        }
        let changed = !to_add.is_empty() || !to_remove.is_empty();
        for descriptor in to_add {
            let key = descriptor.key.clone().unwrap_or_else(|| synthesize_key(&descriptor));
            match self.submit_task(descriptor.clone()) {
                Ok(_) => {
                    self.schedule.insert(key, descriptor);
                }
                Err(e) => warn!("Could not schedule task {}: {}", key, e),
            }
        }
        
        debug!("{} tasks queued after schedule update", self.queue.len());
        
        if persist && changed {
            let wire: Vec<WireTaskDescriptor> = self.schedule.values().map(|d| d.to_wire()).collect();
            if let Err(e) = self.db.save_schedule(&wire) {
                error!("Failed to save schedule: {}", e);
            }
        }
    }
    
    pub fn update_preferences(&mut self, preferences: Preferences) -> Result<(), SchedulerError> {
        if let Some(threshold) = preferences.battery_threshold {
            self.resources.set_battery_threshold(threshold)?;
        }
        if let Some(profile) = preferences.data_limit {
            self.resources.set_data_profile(profile);
        }
        if let Some(interval) = preferences.checkin_interval_sec {
            self.checkin_interval = Duration::from_secs(interval.max(MIN_CHECKIN_INTERVAL_SEC));
            self.next_checkin = Instant::now() + self.checkin_interval;
            info!("Checkin interval set to {} seconds", self.checkin_interval.as_secs());
        }
        Ok(())
    }
    
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let stat = |name: &str| {
            self.db.stat(name).unwrap_or_else(|e| {
                warn!("Failed to read {} counter: {}", name, e);
                0
            })
        };
        let until_checkin = self.next_checkin.saturating_duration_since(Instant::now());
        SchedulerSnapshot {
            queued: self.queue.snapshot(),
            pending: self.pending.len(),
            current: self.runner.current_task(),
            paused: self.is_paused(),
            last_checkin: self.checkin.last_checkin(),
            next_checkin: chrono::Duration::from_std(until_checkin).ok().map(|d| self.now() + d),
            completed: stat(STAT_COMPLETED),
            failed: stat(STAT_FAILED),
            battery_threshold: self.resources.battery_threshold(),
            data_used_bytes: self.resources.usage().unwrap_or_else(|e| {
                warn!("Failed to read data usage: {}", e);
                None
            }).map(|r| r.bytes_used),
            awaiting_upload: self.db.pending_count().unwrap_or_else(|e| {
                warn!("Failed to count stored results: {}", e);
                0
            }),
        }
    }
    
    /// Cancel everything, record what was cut short and stop the worker
    pub async fn stop(&mut self) {
        info!("Stopping scheduler");
        if let Some(checkin) = self.checkin_task.take() {
            checkin.abort();
        }
        self.executor.shutdown();
        self.pending.cancel_all();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("Executor worker ended abnormally: {}", e);
            }
        }
        self.collect_finished();
        if !self.queue.is_empty() {
            let dropped = self.queue.clear();
            debug!("Dropped {} queued tasks", dropped.len());
        }
        output::status(&self.events, "Scheduler stopped");
    }
    
    /// Start the actor
    pub fn spawn(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let join = tokio::spawn(self.run(rx));
        (SchedulerHandle { tx }, join)
    }
    
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.checkin.prepare();
        self.handle_measurement();
        
        loop {
            let measurement_at = self.next_measurement;
            let retry_at = self.retry_at;
            let checkin_at = self.next_checkin;
            
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                Some(id) = self.completions.recv() => Wake::Completed(id),
                Some(outcome) = self.checkin_done.recv() => Wake::CheckinDone(outcome),
                _ = sleep_until(measurement_at) => Wake::Measurement,
                _ = tokio::time::sleep_until(checkin_at) => Wake::Checkin,
                _ = sleep_until(retry_at) => Wake::Retry,
            };
            
            match wake {
                Wake::Command(Some(command)) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Wake::Command(None) => {
                    self.stop().await;
                    break;
                }
                Wake::Completed(id) => {
                    debug!("Task {} completed", id);
                    self.collect_finished();
                    self.handle_measurement();
                }
                Wake::CheckinDone(outcome) => self.finish_checkin(outcome),
                Wake::Measurement => {
                    self.next_measurement = None;
                    self.collect_finished();
                    self.handle_measurement();
                }
                Wake::Checkin => {
                    self.next_checkin = Instant::now() + self.checkin_interval;
                    self.handle_checkin(false);
                }
                Wake::Retry => {
                    self.retry_at = None;
                    self.handle_checkin(false);
                }
            }
        }
        info!("Scheduler stopped");
    }
    
    /// Returns false once the scheduler has stopped
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Submit(descriptor, reply) => {
                let _ = reply.send(self.submit_task(descriptor));
                self.handle_measurement();
            }
            Command::RemoveByKey(key, reply) => {
                let _ = reply.send(self.remove_task_by_key(&key));
            }
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::CheckinNow => {
                self.handle_checkin(true);
            }
            Command::UpdatePreferences(preferences, reply) => {
                let _ = reply.send(self.update_preferences(preferences));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }
}

/// Upload stored results and side-channel documents, then fetch the
/// schedule. Upload problems never block the schedule download.
async fn exchange(client: &CheckinClient, job: CheckinJob) -> CheckinOutcome {
    let mut uploaded = Vec::new();
    if !job.results.is_empty() {
        let (ids, results): (Vec<i64>, Vec<WireResult>) = job.results.into_iter().map(|s| (s.id, s.result)).unzip();
        match client.upload_results(&results).await {
            Ok(()) => uploaded = ids,
            Err(e) => warn!("Result upload failed, keeping results for next time: {}", e),
        }
    }
    
    let mut undelivered = Vec::new();
    for (path, document) in job.side_uploads {
        if let Err(e) = client.upload_side_channel(&path, &document).await {
            warn!("Upload to {} failed: {}", path, e);
            undelivered.push((path, document));
        }
    }
    
    let schedule = if job.fetch_schedule {
        client.checkin().await.map(Some)
    } else {
        Ok(None)
    };
    CheckinOutcome {
        uploaded,
        undelivered,
        schedule,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Scale the interval by the active profile's frequency parameter.
/// Returns false when the profile disables the task.
fn adjust_interval(descriptor: &mut MeasurementDescriptor, profile: DataUsageProfile, now: DateTime<Utc>) -> bool {
    let Some(raw) = descriptor.param(profile.frequency_param()) else {
        return true;
    };
    let factor: f64 = match raw.trim().parse() {
        Ok(f) => f,
        Err(_) => {
            warn!("Ignoring bad {} value {:?} on {:?}", profile.frequency_param(), raw, descriptor.key);
            return true;
        }
    };
    if factor <= 0.0 {
        info!("Task {:?} disabled for profile {}", descriptor.key, profile.label());
        return false;
    }
    descriptor.interval_sec *= factor;
    descriptor.update_start_time(now);
    debug!("Task {:?} interval scaled by {} to {}s", descriptor.key, factor, descriptor.interval_sec);
    true
}

/// Stable key for schedule entries the server sent without one
fn synthesize_key(descriptor: &MeasurementDescriptor) -> String {
    let params: Vec<String> = descriptor
        .parameters
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!("{}:{}", descriptor.kind.tag(), params.join(","))
}

fn rrc_document(result: &MeasurementResult) -> serde_json::Value {
    json!({
        "device_id": result.device_id,
        "network_type": result.properties.network_type,
        "timestamp": result.timestamp.timestamp_millis(),
        "task_key": result.task_key(),
        "values": result.values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkin::CredentialManager;
    use crate::clock::{ManualClock, SharedClock};
    use crate::device::NetworkType;
    use crate::measurement::descriptor::USER_PRIORITY;
    use crate::test_support::{recording_registry, ProbeLog, StaticDeviceInfo};
    use chrono::TimeZone;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    
    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        device: Arc<StaticDeviceInfo>,
        log: ProbeLog,
        scheduler: Scheduler,
    }
    
    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }
    
    fn fixture_with(server: &MockServer, db: Database, profile: DataUsageProfile) -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let shared_clock: SharedClock = clock.clone();
        let device = Arc::new(StaticDeviceInfo::new());
        let resources = Arc::new(
            ResourceCapManager::new(dir.path(), 60, profile, 1, device.clone(), shared_clock.clone()).unwrap(),
        );
        let events = output::event_channel();
        let checkin = CheckinClient::new(
            &server.uri(),
            Duration::from_secs(5),
            CredentialManager::anonymous(),
            device.clone(),
            resources.clone(),
            events.clone(),
            shared_clock.clone(),
        )
        .unwrap();
        let log = ProbeLog::default();
        let ctx = TaskContext {
            device: device.clone(),
            clock: shared_clock,
        };
        let scheduler = Scheduler::new(
            SchedulerConfig {
                checkin_interval: Duration::from_secs(3600),
                retry: RetryPolicy::default(),
                start_paused: false,
            },
            recording_registry(log.clone()),
            checkin,
            db,
            resources,
            ctx,
            events,
        );
        Fixture {
            _dir: dir,
            clock,
            device,
            log,
            scheduler,
        }
    }
    
    fn fixture(server: &MockServer) -> Fixture {
        fixture_with(server, Database::in_memory().unwrap(), DataUsageProfile::Unlimited)
    }
    
    fn ping(key: &str, priority: i64, start: DateTime<Utc>) -> MeasurementDescriptor {
        MeasurementDescriptor::builder(MeasurementKind::Ping)
            .key(key)
            .priority(priority)
            .start_time(start)
            .param("target", "example.com")
            .build(t0())
    }
    
    /// Dispatch and wait until nothing is queued due or running
    async fn run_until_idle(s: &mut Scheduler) {
        loop {
            s.handle_measurement();
            if s.executor.is_idle() {
                s.collect_finished();
                return;
            }
            s.completions.recv().await.unwrap();
            s.collect_finished();
        }
    }
    
    /// Run one checkin to completion, as the actor would
    async fn checkin(s: &mut Scheduler, force: bool) {
        if s.handle_checkin(force) {
            let outcome = s.checkin_done.recv().await.unwrap();
            s.finish_checkin(outcome);
        }
    }
    
    async fn mount_empty_checkin(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(server)
            .await;
    }
    
    fn queued_keys(s: &Scheduler) -> Vec<String> {
        s.queue
            .snapshot()
            .into_iter()
            .map(|q| q.descriptor.key.unwrap_or_default())
            .collect()
    }
    
    #[tokio::test]
    async fn test_user_task_runs_before_queued_system_tasks() {
        let server = MockServer::start().await;
        let mut f = fixture(&server);
        let earlier = t0() - chrono::Duration::minutes(10);
        for p in [300, 100, 200] {
            f.scheduler.submit_task(ping(&format!("p{}", p), p, earlier)).unwrap();
        }
        let user = MeasurementDescriptor::builder(MeasurementKind::Http)
            .key("user")
            .priority(USER_PRIORITY)
            .start_time(t0())
            .param("url", "http://example.com")
            .build(t0());
        f.scheduler.submit_task(user).unwrap();
        
        run_until_idle(&mut f.scheduler).await;
        
        assert_eq!(*f.log.lock().unwrap(), vec!["user", "p100", "p200", "p300"]);
        assert_eq!(f.scheduler.user_results().entries().len(), 1);
        assert_eq!(f.scheduler.system_results().entries().len(), 3);
        assert_eq!(f.scheduler.snapshot().completed, 4);
    }
    
    #[tokio::test]
    async fn test_skipped_task_is_not_uploaded() {
        let server = MockServer::start().await;
        mount_empty_checkin(&server).await;
        Mock::given(method("POST"))
            .and(path("/postmeasurement"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(0)
            .mount(&server)
            .await;
        
        let mut f = fixture(&server);
        f.device.set_battery(40, false);
        f.scheduler.submit_task(ping("p", 10, t0())).unwrap();
        run_until_idle(&mut f.scheduler).await;
        
        // The probe never ran and nothing was stored
        assert!(f.log.lock().unwrap().is_empty());
        assert_eq!(f.scheduler.db.pending_count().unwrap(), 0);
        
        // Below the threshold an unforced checkin is skipped entirely
        checkin(&mut f.scheduler, false).await;
        assert!(f.scheduler.checkin.last_checkin().is_none());
        checkin(&mut f.scheduler, true).await;
        assert!(f.scheduler.checkin.last_checkin().is_some());
    }
    
    #[tokio::test]
    async fn test_deadline_failure_reported_once() {
        let server = MockServer::start().await;
        mount_empty_checkin(&server).await;
        Mock::given(method("POST"))
            .and(path("/postmeasurement"))
            .and(body_string_contains("Deadline passed before execution"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;
        
        let mut f = fixture(&server);
        let late = MeasurementDescriptor::builder(MeasurementKind::Ping)
            .key("late")
            .priority(5)
            .start_time(t0())
            .end_time(t0() + chrono::Duration::minutes(1))
            .build(t0());
        f.scheduler.submit_task(late).unwrap();
        f.clock.advance(chrono::Duration::minutes(2));
        
        f.scheduler.handle_measurement();
        f.scheduler.collect_finished();
        f.scheduler.collect_finished();
        assert!(f.log.lock().unwrap().is_empty());
        assert_eq!(f.scheduler.db.pending_count().unwrap(), 1);
        assert_eq!(f.scheduler.snapshot().failed, 1);
        
        checkin(&mut f.scheduler, true).await;
        assert_eq!(f.scheduler.db.pending_count().unwrap(), 0);
        checkin(&mut f.scheduler, true).await;
    }
    
    #[tokio::test]
    async fn test_failed_checkin_arms_retry_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        
        let mut f = fixture(&server);
        let mut armed = Vec::new();
        for _ in 0..6 {
            checkin(&mut f.scheduler, false).await;
            armed.push(f.scheduler.retry_at.is_some());
        }
        // Retries at 20, 40, 60, 60 seconds, then back to the regular period
        assert_eq!(armed, vec![true, true, true, true, false, true]);
    }
    
    #[tokio::test]
    async fn test_schedule_reconciliation() {
        let server = MockServer::start().await;
        let mut f = fixture(&server);
        let wire = |key: &str, kind: &str, param: &str| WireTaskDescriptor {
            kind: kind.into(),
            key: Some(key.into()),
            interval_sec: Some(600.0),
            count: Some(-1),
            priority: Some(10),
            parameters: Some([("target".to_string(), param.to_string())].into_iter().collect()),
            ..Default::default()
        };
        
        f.scheduler.update_schedule(vec![
            wire("a", "ping", "a.example"),
            wire("b", "dns_lookup", "b.example"),
            wire("c", "ping", "c.example"),
        ]);
        let a_id = f.scheduler.queue.snapshot().iter().find(|q| q.descriptor.key.as_deref() == Some("a")).unwrap().id;
        
        f.scheduler.update_schedule(vec![
            wire("a", "ping", "a.example"),
            wire("b", "dns_lookup", "changed.example"),
            wire("d", "ping", "d.example"),
        ]);
        
        let snapshot = f.scheduler.queue.snapshot();
        let mut keys = queued_keys(&f.scheduler);
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "d"]);
        let a = snapshot.iter().find(|q| q.descriptor.key.as_deref() == Some("a")).unwrap();
        assert_eq!(a.id, a_id, "unchanged task keeps its place");
        let b = snapshot.iter().find(|q| q.descriptor.key.as_deref() == Some("b")).unwrap();
        assert_eq!(b.descriptor.param("target"), Some("changed.example"));
        
        assert_eq!(f.scheduler.db.load_schedule().unwrap().len(), 3);
    }
    
    #[tokio::test]
    async fn test_profile_frequency_scaling() {
        let server = MockServer::start().await;
        let mut f = fixture_with(&server, Database::in_memory().unwrap(), DataUsageProfile::Profile1);
        let wire = |key: &str, factor: &str| WireTaskDescriptor {
            kind: "ping".into(),
            key: Some(key.into()),
            interval_sec: Some(600.0),
            parameters: Some(
                [
                    ("target".to_string(), "example.com".to_string()),
                    ("profile_1_freq".to_string(), factor.to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        };
        
        f.scheduler.update_schedule(vec![wire("slow", "2"), wire("off", "0"), wire("bad", "x")]);
        
        let snapshot = f.scheduler.queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        let slow = snapshot.iter().find(|q| q.descriptor.key.as_deref() == Some("slow")).unwrap();
        assert_eq!(slow.descriptor.interval_sec, 1200.0);
        assert_eq!(slow.descriptor.start_time, t0() + chrono::Duration::seconds(1200));
        let bad = snapshot.iter().find(|q| q.descriptor.key.as_deref() == Some("bad")).unwrap();
        assert_eq!(bad.descriptor.interval_sec, 600.0);
    }
    
    #[tokio::test]
    async fn test_missing_key_is_synthesized() {
        let server = MockServer::start().await;
        let mut f = fixture(&server);
        let unkeyed = WireTaskDescriptor {
            kind: "ping".into(),
            parameters: Some([("target".to_string(), "example.com".to_string())].into_iter().collect()),
            ..Default::default()
        };
        f.scheduler.update_schedule(vec![unkeyed.clone()]);
        f.scheduler.update_schedule(vec![unkeyed]);
        assert_eq!(queued_keys(&f.scheduler), vec!["ping:target=example.com"]);
    }
    
    #[tokio::test]
    async fn test_restore_moves_start_to_interval_grid() {
        let server = MockServer::start().await;
        let mut db = Database::in_memory().unwrap();
        let saved = ping("saved", 10, t0() - chrono::Duration::minutes(25));
        let saved = MeasurementDescriptor {
            interval_sec: 600.0,
            count: -1,
            ..saved
        };
        let expired = MeasurementDescriptor {
            key: Some("expired".into()),
            end_time: t0() - chrono::Duration::minutes(1),
            ..saved.clone()
        };
        db.save_schedule(&[saved.to_wire(), expired.to_wire()]).unwrap();
        
        let mut f = fixture_with(&server, db, DataUsageProfile::Unlimited);
        f.scheduler.restore();
        
        let snapshot = f.scheduler.queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].descriptor.start_time, t0() + chrono::Duration::minutes(5));
        assert_eq!(f.scheduler.schedule.len(), 1);
    }
    
    #[tokio::test]
    async fn test_rrc_raw_data_goes_to_side_channel() {
        let server = MockServer::start().await;
        mount_empty_checkin(&server).await;
        Mock::given(method("POST"))
            .and(path("/postmeasurement"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rrc/uploadRRCInference"))
            .and(body_string_contains("\"task_key\":\"rrc1\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;
        
        let mut f = fixture(&server);
        f.device.set_network(NetworkType::Mobile);
        let rrc = MeasurementDescriptor::builder(MeasurementKind::Rrc)
            .key("rrc1")
            .priority(10)
            .start_time(t0())
            .param("upload", "true")
            .build(t0());
        f.scheduler.submit_task(rrc).unwrap();
        run_until_idle(&mut f.scheduler).await;
        
        checkin(&mut f.scheduler, true).await;
        assert!(f.scheduler.side_uploads.is_empty());
    }
    
    #[tokio::test]
    async fn test_preferences_update() {
        let server = MockServer::start().await;
        let mut f = fixture(&server);
        
        f.scheduler
            .update_preferences(Preferences {
                battery_threshold: Some(20),
                checkin_interval_sec: Some(60),
                data_limit: Some(DataUsageProfile::Profile2),
            })
            .unwrap();
        assert_eq!(f.scheduler.resources.battery_threshold(), 20);
        assert_eq!(f.scheduler.resources.data_profile(), DataUsageProfile::Profile2);
        assert_eq!(f.scheduler.checkin_interval, Duration::from_secs(MIN_CHECKIN_INTERVAL_SEC));
        
        let bad = Preferences {
            battery_threshold: Some(101),
            ..Default::default()
        };
        assert!(matches!(
            f.scheduler.update_preferences(bad),
            Err(SchedulerError::Resource(ResourceError::InvalidThreshold(101)))
        ));
        assert_eq!(f.scheduler.resources.battery_threshold(), 20);
    }
    
    #[tokio::test]
    async fn test_slow_checkin_does_not_hold_up_user_tasks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;
        let f = fixture(&server);
        let log = f.log.clone();
        let (handle, join) = f.scheduler.spawn();
        
        // The first checkin starts right away and is now waiting on the server
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        let user = MeasurementDescriptor::builder(MeasurementKind::Http)
            .key("user")
            .priority(USER_PRIORITY)
            .start_time(t0())
            .param("url", "http://example.com")
            .build(t0());
        handle.submit_task(user).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        
        while log.lock().unwrap().is_empty() {
            assert!(started.elapsed() < Duration::from_secs(1), "user task waited for the checkin");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*log.lock().unwrap(), vec!["user"]);
        
        handle.request_stop().await.unwrap();
        join.await.unwrap();
    }
    
    #[tokio::test]
    async fn test_overlapping_checkin_is_not_started() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])).set_delay(Duration::from_millis(300)))
            .expect(1)
            .mount(&server)
            .await;
        let mut f = fixture(&server);
        
        assert!(f.scheduler.handle_checkin(true));
        assert!(!f.scheduler.handle_checkin(true));
        let outcome = f.scheduler.checkin_done.recv().await.unwrap();
        f.scheduler.finish_checkin(outcome);
        assert!(f.scheduler.checkin_task.is_none());
        assert!(f.scheduler.checkin.last_checkin().is_some());
    }
    
    #[tokio::test]
    async fn test_stop_command_ends_run_loop() {
        let server = MockServer::start().await;
        mount_empty_checkin(&server).await;
        let mut f = fixture(&server);
        
        let (tx, _rx) = oneshot::channel();
        let later = ping("later", 10, t0() + chrono::Duration::hours(1));
        assert!(f.scheduler.handle_command(Command::Submit(later, tx)).await);
        assert_eq!(f.scheduler.queue.len(), 1);
        
        let (tx, rx) = oneshot::channel();
        assert!(!f.scheduler.handle_command(Command::Stop(tx)).await);
        rx.await.unwrap();
        assert!(f.scheduler.queue.is_empty());
        assert!(f.scheduler.worker.is_none());
    }
    
    #[tokio::test]
    async fn test_handle_round_trip_and_stop() {
        let server = MockServer::start().await;
        mount_empty_checkin(&server).await;
        let f = fixture(&server);
        let (handle, join) = f.scheduler.spawn();
        
        handle.pause().await.unwrap();
        let later = ping("later", 10, t0() + chrono::Duration::hours(1));
        handle.submit_task(later).await.unwrap();
        
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.paused);
        assert_eq!(snapshot.queued.len(), 1);
        assert!(handle.remove_task_by_key("later").await.unwrap());
        assert!(!handle.remove_task_by_key("later").await.unwrap());
        
        handle.request_stop().await.unwrap();
        join.await.unwrap();
        assert!(matches!(handle.snapshot().await, Err(SchedulerError::Stopped)));
    }
}
