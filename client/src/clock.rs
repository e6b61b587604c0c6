//! Wall-clock abstraction
//!
//! Everything that compares against "now" (deadlines, start times, data
//! usage periods, checkin bookkeeping) reads time through a [`Clock`] so the
//! scheduling logic can be driven deterministically in tests.

use chrono::{DateTime, Utc};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// System time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock; clones share the same time
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<std::sync::Mutex<DateTime<Utc>>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(std::sync::Mutex::new(start)),
        }
    }
    
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
