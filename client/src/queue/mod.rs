//! Task queue and pending set
//!
//! A task is in exactly one place at a time: the queue (not yet started),
//! the pending set (handed to the executor, or dropped at its deadline and
//! awaiting a failure report), or nowhere (finished and collected). Each
//! collection has its own lock and neither is locked while the other is
//! held.

use crate::measurement::descriptor::INVALID_PRIORITY;
use crate::measurement::{MeasurementDescriptor, MeasurementError, MeasurementResult, MeasurementTask, TaskId};
use crate::runner::ExecutionHandle;
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use thiserror::Error;

/// Admission cap for system tasks, applied to queue and pending set alike
pub const MAX_TASK_QUEUE_SIZE: usize = 100;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejected {
    #[error("task priority cannot be ordered")]
    Incomparable,
    #[error("task queue is full")]
    QueueFull,
    #[error("pending set is full")]
    PendingFull,
}

struct QueuedTask {
    seq: u64,
    task: MeasurementTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority, then start time, then insertion order. Incomparable tasks
/// never get past admission.
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .compare(&other.task)
            .unwrap_or(Ordering::Equal)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<QueuedTask>>,
    next_seq: u64,
}

/// Summary of a queued task for consoles
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSummary {
    pub id: TaskId,
    pub descriptor: MeasurementDescriptor,
}

/// Thread-safe min-heap of not-yet-started tasks
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
    
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
    
    /// Admission control. User-priority tasks bypass the size caps.
    pub fn submit(&self, task: MeasurementTask, pending_len: usize) -> Result<(), AdmissionRejected> {
        let descriptor = task.descriptor();
        if descriptor.priority == INVALID_PRIORITY {
            return Err(AdmissionRejected::Incomparable);
        }
        let mut inner = self.lock();
        if !descriptor.is_user_task() {
            if inner.heap.len() >= MAX_TASK_QUEUE_SIZE {
                return Err(AdmissionRejected::QueueFull);
            }
            if pending_len >= MAX_TASK_QUEUE_SIZE {
                return Err(AdmissionRejected::PendingFull);
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Reverse(QueuedTask { seq, task }));
        Ok(())
    }
    
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }
    
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    
    /// Milliseconds until the head is due (negative when overdue)
    pub fn head_time_from_execution(&self, now: DateTime<Utc>) -> Option<i64> {
        self.lock()
            .heap
            .peek()
            .map(|Reverse(q)| q.task.descriptor().time_from_execution(now))
    }
    
    /// Pop the head only if its start time has arrived
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<MeasurementTask> {
        let mut inner = self.lock();
        let due = inner
            .heap
            .peek()
            .is_some_and(|Reverse(q)| q.task.descriptor().time_from_execution(now) <= 0);
        if due {
            inner.heap.pop().map(|Reverse(q)| q.task)
        } else {
            None
        }
    }
    
    /// Remove at most one task with this key
    pub fn remove_by_key(&self, key: &str) -> Option<MeasurementTask> {
        let mut inner = self.lock();
        let mut items = std::mem::take(&mut inner.heap).into_vec();
        let removed = items
            .iter()
            .position(|Reverse(q)| q.task.key() == Some(key))
            .map(|i| items.swap_remove(i).0.task);
        inner.heap = BinaryHeap::from(items);
        removed
    }
    
    /// Queue contents in execution order
    pub fn snapshot(&self) -> Vec<QueuedSummary> {
        let inner = self.lock();
        let mut items: Vec<&QueuedTask> = inner.heap.iter().map(|Reverse(q)| q).collect();
        items.sort();
        items
            .into_iter()
            .map(|q| QueuedSummary {
                id: q.task.id(),
                descriptor: q.task.descriptor().clone(),
            })
            .collect()
    }
    
    pub fn clear(&self) -> Vec<MeasurementTask> {
        let mut inner = self.lock();
        std::mem::take(&mut inner.heap)
            .into_vec()
            .into_iter()
            .map(|Reverse(q)| q.task)
            .collect()
    }
}

pub struct PendingEntry {
    pub descriptor: MeasurementDescriptor,
    /// `None` for tasks dropped at their deadline without running
    pub handle: Option<ExecutionHandle>,
}

impl PendingEntry {
    pub fn user(&self) -> bool {
        self.descriptor.is_user_task()
    }
}

/// How a pending task ended, as seen at collection time
#[derive(Debug, Clone, PartialEq)]
pub enum Collected {
    Finished(MeasurementResult),
    Failed(MeasurementError),
    Skipped,
    Cancelled,
    DeadlinePassed,
}

#[derive(Debug, Clone)]
pub struct CollectedTask {
    pub descriptor: MeasurementDescriptor,
    pub outcome: Collected,
}

/// In-flight and deadline-dropped tasks keyed by task id
#[derive(Default)]
pub struct PendingSet {
    entries: Mutex<HashMap<TaskId, PendingEntry>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }
    
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, PendingEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
    
    pub fn insert(&self, id: TaskId, entry: PendingEntry) {
        self.lock().insert(id, entry);
    }
    
    pub fn len(&self) -> usize {
        self.lock().len()
    }
    
    /// Remove and classify every entry that has reached a final state.
    /// Unfinished entries whose deadline has passed are cancelled and
    /// reported as deadline failures; others stay.
    pub fn collect(&self, now: DateTime<Utc>) -> Vec<CollectedTask> {
        let mut entries = self.lock();
        let mut done = Vec::new();
        let ids: Vec<TaskId> = entries.keys().copied().collect();
        for id in ids {
            let Some(entry) = entries.get(&id) else {
                continue;
            };
            let outcome = match &entry.handle {
                None => Some(Collected::DeadlinePassed),
                Some(handle) => match handle.outcome() {
                    Some(Ok(result)) => Some(Collected::Finished(result)),
                    Some(Err(e)) if e.is_skip() => Some(Collected::Skipped),
                    Some(Err(MeasurementError::Cancelled)) => Some(Collected::Cancelled),
                    Some(Err(MeasurementError::DeadlineExpired)) => Some(Collected::DeadlinePassed),
                    Some(Err(e)) => Some(Collected::Failed(e)),
                    None if handle.is_abandoned() => Some(Collected::Cancelled),
                    None if entry.descriptor.is_passed_deadline(now) => {
                        handle.cancel();
                        Some(Collected::DeadlinePassed)
                    }
                    None => None,
                },
            };
            if let Some(outcome) = outcome {
                if let Some(entry) = entries.remove(&id) {
                    done.push(CollectedTask {
                        descriptor: entry.descriptor,
                        outcome,
                    });
                }
            }
        }
        done
    }
    
    /// Cancel every in-flight execution
    pub fn cancel_all(&self) {
        for entry in self.lock().values() {
            if let Some(handle) = &entry.handle {
                handle.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::descriptor::USER_PRIORITY;
    use crate::measurement::{MeasurementKind, ProbeRegistry};
    use crate::test_support::recording_registry;
    use chrono::{Duration, TimeZone};
    
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }
    
    fn registry() -> ProbeRegistry {
        recording_registry(Default::default())
    }
    
    fn task(registry: &ProbeRegistry, key: &str, priority: i64, start_offset_sec: i64) -> MeasurementTask {
        let d = MeasurementDescriptor::builder(MeasurementKind::Ping)
            .key(key)
            .priority(priority)
            .start_time(now() + Duration::seconds(start_offset_sec))
            .build(now());
        registry.create_task(d).unwrap()
    }
    
    #[test]
    fn test_orders_by_priority_then_start_time() {
        let r = registry();
        let queue = TaskQueue::new();
        queue.submit(task(&r, "c", 300, 0), 0).unwrap();
        queue.submit(task(&r, "b-late", 200, 60), 0).unwrap();
        queue.submit(task(&r, "b-early", 200, 10), 0).unwrap();
        queue.submit(task(&r, "a", 100, 120), 0).unwrap();
        queue.submit(task(&r, "user", USER_PRIORITY, 500), 0).unwrap();
        
        let later = now() + Duration::days(1);
        let keys: Vec<String> = std::iter::from_fn(|| queue.pop_due(later))
            .map(|t| t.key().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["user", "a", "b-early", "b-late", "c"]);
    }
    
    #[test]
    fn test_snapshot_matches_pop_order() {
        let r = registry();
        let queue = TaskQueue::new();
        for (key, prio) in [("x", 5), ("y", 1), ("z", 3)] {
            queue.submit(task(&r, key, prio, 0), 0).unwrap();
        }
        let keys: Vec<_> = queue
            .snapshot()
            .into_iter()
            .map(|s| s.descriptor.key.unwrap())
            .collect();
        assert_eq!(keys, vec!["y", "z", "x"]);
        assert_eq!(queue.len(), 3);
    }
    
    #[test]
    fn test_rejects_incomparable_and_full() {
        let r = registry();
        let queue = TaskQueue::new();
        assert_eq!(
            queue.submit(task(&r, "bad", INVALID_PRIORITY, 0), 0),
            Err(AdmissionRejected::Incomparable)
        );
        
        for i in 0..MAX_TASK_QUEUE_SIZE {
            queue.submit(task(&r, &format!("t{}", i), 10, 0), 0).unwrap();
        }
        assert_eq!(queue.submit(task(&r, "one-more", 10, 0), 0), Err(AdmissionRejected::QueueFull));
        
        // User tasks are never turned away
        queue.submit(task(&r, "user", USER_PRIORITY, 0), MAX_TASK_QUEUE_SIZE).unwrap();
        assert_eq!(queue.len(), MAX_TASK_QUEUE_SIZE + 1);
        
        let other = TaskQueue::new();
        assert_eq!(
            other.submit(task(&r, "p", 10, 0), MAX_TASK_QUEUE_SIZE),
            Err(AdmissionRejected::PendingFull)
        );
    }
    
    #[test]
    fn test_pop_due_respects_start_time() {
        let r = registry();
        let queue = TaskQueue::new();
        queue.submit(task(&r, "later", 1, 30), 0).unwrap();
        
        assert!(queue.pop_due(now()).is_none());
        assert_eq!(queue.head_time_from_execution(now()), Some(30_000));
        assert!(queue.pop_due(now() + Duration::seconds(30)).is_some());
        assert!(queue.is_empty());
    }
    
    #[test]
    fn test_remove_by_key_removes_one() {
        let r = registry();
        let queue = TaskQueue::new();
        queue.submit(task(&r, "dup", 1, 0), 0).unwrap();
        queue.submit(task(&r, "dup", 2, 0), 0).unwrap();
        queue.submit(task(&r, "other", 3, 0), 0).unwrap();
        
        assert!(queue.remove_by_key("dup").is_some());
        assert_eq!(queue.len(), 2);
        assert!(queue.remove_by_key("missing").is_none());
    }
    
    #[test]
    fn test_collect_reports_dropped_deadline_once() {
        let pending = PendingSet::new();
        let d = MeasurementDescriptor::builder(MeasurementKind::Http)
            .end_time(now() - Duration::seconds(1))
            .build(now() - Duration::hours(1));
        pending.insert(7, PendingEntry { descriptor: d, handle: None });
        
        let collected = pending.collect(now());
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].outcome, Collected::DeadlinePassed);
        assert!(pending.collect(now()).is_empty());
    }
    
    #[test]
    fn test_collect_cancels_running_task_past_deadline() {
        let pending = PendingSet::new();
        let d = MeasurementDescriptor::builder(MeasurementKind::Http)
            .start_time(now())
            .end_time(now() + Duration::minutes(1))
            .build(now());
        let (handle, _outcome) = ExecutionHandle::manual();
        pending.insert(9, PendingEntry { descriptor: d, handle: Some(handle.clone()) });
        
        assert!(pending.collect(now()).is_empty());
        assert!(!handle.is_cancelled());
        
        let later = now() + Duration::minutes(2);
        let collected = pending.collect(later);
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].outcome, Collected::DeadlinePassed);
        assert!(handle.is_cancelled());
        assert!(pending.collect(later).is_empty());
        assert_eq!(pending.len(), 0);
    }
}
