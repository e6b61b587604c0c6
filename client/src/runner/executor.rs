//! Single-worker executor
//!
//! Jobs run strictly one at a time, in submission order. Each job gets a
//! deadline watchdog that cancels it once its descriptor's end time passes.

use super::{RunMode, TaskRunner};
use crate::measurement::{MeasurementError, MeasurementResult, MeasurementTask, TaskId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub type TaskOutcome = Result<MeasurementResult, MeasurementError>;

/// Completion handle for a submitted task
#[derive(Clone)]
pub struct ExecutionHandle {
    outcome: watch::Receiver<Option<TaskOutcome>>,
    cancel: CancellationToken,
}

impl ExecutionHandle {
    pub fn is_done(&self) -> bool {
        self.outcome.borrow().is_some()
    }
    
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.outcome.borrow().clone()
    }
    
    /// The worker went away without reporting an outcome
    pub fn is_abandoned(&self) -> bool {
        !self.is_done() && self.outcome.has_changed().is_err()
    }
    
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
impl ExecutionHandle {
    /// Handle whose outcome the caller reports through the returned sender
    pub fn manual() -> (Self, watch::Sender<Option<TaskOutcome>>) {
        let (tx, rx) = watch::channel(None);
        let handle = Self {
            outcome: rx,
            cancel: CancellationToken::new(),
        };
        (handle, tx)
    }
    
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
    
    /// Wait for the outcome; `Cancelled` if the worker disappears first
    pub async fn wait(&self) -> TaskOutcome {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(|o| o.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(MeasurementError::Cancelled))
    }
}

struct Job {
    task: MeasurementTask,
    mode: RunMode,
    outcome: watch::Sender<Option<TaskOutcome>>,
    cancel: CancellationToken,
}

pub struct Executor {
    jobs: mpsc::UnboundedSender<Job>,
    in_flight: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Executor {
    /// Start the worker. Finished task ids are reported on `completions`.
    pub fn spawn(runner: Arc<TaskRunner>, completions: mpsc::UnboundedSender<TaskId>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(worker_loop(
            rx,
            runner,
            completions,
            in_flight.clone(),
            shutdown.clone(),
        ));
        (
            Self {
                jobs: tx,
                in_flight,
                shutdown,
            },
            worker,
        )
    }
    
    pub fn submit(&self, task: MeasurementTask, mode: RunMode) -> ExecutionHandle {
        let (tx, rx) = watch::channel(None);
        let cancel = self.shutdown.child_token();
        let handle = ExecutionHandle {
            outcome: rx,
            cancel: cancel.clone(),
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            task,
            mode,
            outcome: tx,
            cancel,
        };
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = job.outcome.send(Some(Err(MeasurementError::Cancelled)));
        }
        handle
    }
    
    /// Nothing queued or running
    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }
    
    /// Cancel everything and stop accepting work
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<Job>,
    runner: Arc<TaskRunner>,
    completions: mpsc::UnboundedSender<TaskId>,
    in_flight: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        let id = job.task.id();
        let outcome = execute(&runner, &job).await;
        debug!("Task {} finished: ok={}", id, outcome.is_ok());
        let _ = job.outcome.send(Some(outcome));
        in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = completions.send(id);
    }
    
    // Drain so nobody waits on a job that will never run
    rx.close();
    while let Some(job) = rx.recv().await {
        let _ = job.outcome.send(Some(Err(MeasurementError::Cancelled)));
        in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = completions.send(job.task.id());
    }
    info!("Executor stopped");
}

async fn execute(runner: &TaskRunner, job: &Job) -> TaskOutcome {
    let clock = runner.context().clock.clone();
    let descriptor = job.task.descriptor();
    
    if descriptor.is_passed_deadline(clock.now()) {
        return Err(MeasurementError::DeadlineExpired);
    }
    if job.cancel.is_cancelled() {
        return Err(MeasurementError::Cancelled);
    }
    
    let remaining = (descriptor.end_time - clock.now()).to_std().unwrap_or_default();
    let watchdog_cancel = job.cancel.clone();
    let finished = CancellationToken::new();
    let watchdog_done = finished.clone();
    let watchdog = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {
                debug!("Deadline reached, cancelling");
                watchdog_cancel.cancel();
            }
            _ = watchdog_done.cancelled() => {}
        }
    });
    
    let outcome = runner.run(&job.task, job.mode, &job.cancel).await;
    finished.cancel();
    let _ = watchdog.await;
    
    match outcome {
        Err(MeasurementError::Cancelled) if descriptor.is_passed_deadline(clock.now()) => {
            Err(MeasurementError::DeadlineExpired)
        }
        other => other,
    }
}
