//! Measurement descriptors
//!
//! A descriptor is the immutable description of one scheduled measurement:
//! what to run, when, how often, and with which parameters. Only the start
//! time and remaining count change, and only on the copy produced for the
//! next recurrence.

use super::error::MeasurementError;
use super::kind::MeasurementKind;
use chrono::{DateTime, Duration, Utc};
use protocol::wire::WireTaskDescriptor;
use std::collections::BTreeMap;

/// Recurrence spacing used when none (or a non-positive one) is given
pub const DEFAULT_SYSTEM_INTERVAL_SEC: f64 = 3600.0;

/// Spacing for repeated user measurements
pub const DEFAULT_USER_INTERVAL_SEC: f64 = 5.0;

/// Latest allowed deadline, relative to construction time
pub const TASK_EXPIRATION_SEC: i64 = 7 * 24 * 3600;

/// `count` value meaning "repeat forever"
pub const INFINITE_COUNT: i64 = -1;

/// Reserved priority of user-initiated tasks; beats every system task
pub const USER_PRIORITY: i64 = i64::MIN;

/// Priority that cannot be ordered against anything
pub const INVALID_PRIORITY: i64 = i64::MAX;

/// Priority of schedule entries that do not name one
pub const DEFAULT_SYSTEM_PRIORITY: i64 = 0;

#[derive(Debug, Clone)]
pub struct MeasurementDescriptor {
    pub kind: MeasurementKind,
    pub key: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub interval_sec: f64,
    pub count: i64,
    pub priority: i64,
    pub parameters: BTreeMap<String, String>,
}

/// Structural equality. Start and end times are excluded: the server
/// re-sends the same task with fresh times on every checkin.
impl PartialEq for MeasurementDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.key == other.key
            && self.interval_sec == other.interval_sec
            && self.count == other.count
            && self.priority == other.priority
            && self.parameters == other.parameters
    }
}

impl MeasurementDescriptor {
    pub fn builder(kind: MeasurementKind) -> DescriptorBuilder {
        DescriptorBuilder {
            kind,
            key: None,
            start_time: None,
            end_time: None,
            interval_sec: 0.0,
            count: 1,
            priority: DEFAULT_SYSTEM_PRIORITY,
            parameters: BTreeMap::new(),
        }
    }
    
    /// Build from a schedule entry. Unknown types fail with
    /// [`MeasurementError::UnknownMeasurementType`].
    pub fn from_wire(wire: &WireTaskDescriptor, now: DateTime<Utc>) -> Result<Self, MeasurementError> {
        let kind = MeasurementKind::from_tag(&wire.kind)?;
        let mut builder = Self::builder(kind)
            .interval_sec(wire.interval_sec.unwrap_or(0.0))
            .count(wire.count.unwrap_or(1))
            .priority(wire.priority.unwrap_or(DEFAULT_SYSTEM_PRIORITY))
            .parameters(wire.parameters.clone().unwrap_or_default());
        if let Some(key) = &wire.key {
            builder = builder.key(key.clone());
        }
        if let Some(start) = wire.start_time {
            builder = builder.start_time(start);
        }
        if let Some(end) = wire.end_time {
            builder = builder.end_time(end);
        }
        Ok(builder.build(now))
    }
    
    /// Wire form used when persisting schedules
    pub fn to_wire(&self) -> WireTaskDescriptor {
        WireTaskDescriptor {
            kind: self.kind.tag().to_string(),
            key: self.key.clone(),
            start_time: Some(self.start_time),
            end_time: Some(self.end_time),
            interval_sec: Some(self.interval_sec),
            count: Some(self.count),
            priority: Some(self.priority),
            parameters: Some(self.parameters.clone()),
        }
    }
    
    /// Wire form attached to results: identical, minus the parameters
    pub fn to_wire_stripped(&self) -> WireTaskDescriptor {
        WireTaskDescriptor {
            parameters: None,
            ..self.to_wire()
        }
    }
    
    pub fn interval(&self) -> Duration {
        Duration::milliseconds((self.interval_sec * 1000.0) as i64)
    }
    
    pub fn is_user_task(&self) -> bool {
        self.priority == USER_PRIORITY
    }
    
    pub fn is_infinite(&self) -> bool {
        self.count == INFINITE_COUNT
    }
    
    pub fn is_passed_deadline(&self, now: DateTime<Utc>) -> bool {
        self.end_time <= now
    }
    
    /// Milliseconds until the start time; negative when overdue
    pub fn time_from_execution(&self, now: DateTime<Utc>) -> i64 {
        (self.start_time - now).num_milliseconds()
    }
    
    /// Reset the start time to one interval from now
    pub fn update_start_time(&mut self, now: DateTime<Utc>) {
        self.start_time = now + self.interval();
    }
    
    /// Descriptor for the next recurrence, if any
    ///
    /// Recurs when `count` is infinite or greater than one and the advanced
    /// start time is still before the deadline.
    pub fn next_recurrence(&self) -> Option<MeasurementDescriptor> {
        if !self.is_infinite() && self.count <= 1 {
            return None;
        }
        let next_start = self.start_time + self.interval();
        if next_start >= self.end_time {
            return None;
        }
        let mut next = self.clone();
        next.start_time = next_start;
        if !next.is_infinite() {
            next.count -= 1;
        }
        Some(next)
    }
    
    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
    
    pub fn require_param(&self, name: &str) -> Result<&str, MeasurementError> {
        match self.param(name) {
            Some(v) if !v.trim().is_empty() => Ok(v.trim()),
            _ => Err(MeasurementError::invalid(name, "missing")),
        }
    }
    
    /// Parse an optional parameter, falling back to `default` when absent
    pub fn param_or<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, MeasurementError> {
        match self.param(name) {
            None => Ok(default),
            Some(v) if v.trim().is_empty() => Ok(default),
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| MeasurementError::invalid(name, format!("cannot parse {:?}", v))),
        }
    }
}

pub struct DescriptorBuilder {
    kind: MeasurementKind,
    key: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    interval_sec: f64,
    count: i64,
    priority: i64,
    parameters: BTreeMap<String, String>,
}

impl DescriptorBuilder {
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
    
    pub fn start_time(mut self, t: DateTime<Utc>) -> Self {
        self.start_time = Some(t);
        self
    }
    
    pub fn end_time(mut self, t: DateTime<Utc>) -> Self {
        self.end_time = Some(t);
        self
    }
    
    pub fn interval_sec(mut self, interval_sec: f64) -> Self {
        self.interval_sec = interval_sec;
        self
    }
    
    pub fn count(mut self, count: i64) -> Self {
        self.count = count;
        self
    }
    
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
    
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
    
    pub fn parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }
    
    /// Apply the construction invariants: interval defaults when
    /// non-positive, start defaults to one interval from `now`, end is
    /// clamped to seven days after `now`.
    pub fn build(self, now: DateTime<Utc>) -> MeasurementDescriptor {
        let interval_sec = if self.interval_sec > 0.0 && self.interval_sec.is_finite() {
            self.interval_sec
        } else {
            DEFAULT_SYSTEM_INTERVAL_SEC
        };
        let horizon = now + Duration::seconds(TASK_EXPIRATION_SEC);
        let end_time = match self.end_time {
            Some(end) if end <= horizon => end,
            _ => horizon,
        };
        let mut descriptor = MeasurementDescriptor {
            kind: self.kind,
            key: self.key,
            start_time: now,
            end_time,
            interval_sec,
            count: self.count,
            priority: self.priority,
            parameters: self.parameters,
        };
        match self.start_time {
            Some(start) => descriptor.start_time = start,
            None => descriptor.update_start_time(now),
        }
        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }
    
    fn ping(count: i64) -> MeasurementDescriptor {
        MeasurementDescriptor::builder(MeasurementKind::Ping)
            .key("ping-1")
            .start_time(now())
            .interval_sec(60.0)
            .count(count)
            .priority(100)
            .param("target", "example.com")
            .build(now())
    }
    
    #[test]
    fn test_defaults_applied() {
        let d = MeasurementDescriptor::builder(MeasurementKind::Http)
            .interval_sec(-5.0)
            .end_time(now() + Duration::days(30))
            .build(now());
        
        assert_eq!(d.interval_sec, DEFAULT_SYSTEM_INTERVAL_SEC);
        assert_eq!(d.start_time, now() + Duration::hours(1));
        assert_eq!(d.end_time, now() + Duration::days(7));
    }
    
    #[test]
    fn test_clone_decrements_count() {
        let next = ping(3).next_recurrence().unwrap();
        assert_eq!(next.count, 2);
        assert_eq!(next.start_time, now() + Duration::seconds(60));
        
        // Parameters and identity carry over
        assert_eq!(next, ping(2));
    }
    
    #[test]
    fn test_clone_infinite_keeps_sentinel() {
        let next = ping(INFINITE_COUNT).next_recurrence().unwrap();
        assert_eq!(next.count, INFINITE_COUNT);
        assert_eq!(next.start_time, now() + Duration::seconds(60));
    }
    
    #[test]
    fn test_no_clone_for_last_run_or_past_deadline() {
        assert!(ping(1).next_recurrence().is_none());
        
        let mut d = ping(5);
        d.end_time = now() + Duration::seconds(30);
        assert!(d.next_recurrence().is_none());
    }
    
    #[test]
    fn test_equality_ignores_times() {
        let a = ping(3);
        let mut b = ping(3);
        b.start_time = now() + Duration::hours(2);
        b.end_time = now() + Duration::hours(3);
        assert_eq!(a, b);
        
        b.parameters.insert("target".into(), "example.org".into());
        assert_ne!(a, b);
    }
    
    #[test]
    fn test_deadline_and_time_from_execution() {
        let d = ping(1);
        assert_eq!(d.time_from_execution(now() - Duration::seconds(2)), 2000);
        assert!(!d.is_passed_deadline(now()));
        assert!(d.is_passed_deadline(d.end_time));
    }
    
    #[test]
    fn test_from_wire_rejects_unknown_type() {
        let wire = WireTaskDescriptor {
            kind: "carrier_pigeon".into(),
            ..Default::default()
        };
        assert!(matches!(
            MeasurementDescriptor::from_wire(&wire, now()),
            Err(MeasurementError::UnknownMeasurementType(_))
        ));
    }
    
    #[test]
    fn test_param_parsing() {
        let d = ping(1);
        assert_eq!(d.require_param("target").unwrap(), "example.com");
        assert!(d.require_param("url").is_err());
        assert_eq!(d.param_or("packet_size_byte", 56u32).unwrap(), 56);
        
        let bad = MeasurementDescriptor::builder(MeasurementKind::Ping)
            .param("packet_size_byte", "big")
            .build(now());
        assert!(bad.param_or("packet_size_byte", 56u32).is_err());
    }
}
