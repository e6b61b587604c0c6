//! Resource caps - battery threshold and rolling cellular data budget
//!
//! Data usage is tracked as a single `(period_start_epoch_sec, bytes_used)`
//! record in a small text file. The record advances to the current period
//! lazily, on the first access after a period has elapsed. Every
//! read-modify-write of the file happens under one lock and the file is
//! replaced atomically (temp file + rename).

use crate::clock::SharedClock;
use crate::device::DeviceInfoProvider;
use crate::measurement::MeasurementKind;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fixed cost charged per checkin/upload for device properties and headers
pub const PHONE_UTIL_COST: u64 = 3 * 1024;

pub const DEFAULT_BATTERY_THRESHOLD: u8 = 60;

pub const DEFAULT_PERIOD_DAYS: u32 = 1;

const USAGE_FILE_NAME: &str = "datausage";

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Battery threshold must be within 0..=100, got {0}")]
    InvalidThreshold(i64),
    
    #[error("Unknown data limit: {0}")]
    InvalidDataLimit(String),
    
    #[error("Data usage file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Monthly data allowance choices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataUsageProfile {
    Profile1,
    Profile2,
    Profile3,
    Profile4,
    Unlimited,
}

impl DataUsageProfile {
    pub fn parse(s: &str) -> Result<Self, ResourceError> {
        match s.trim() {
            "50 MB" => Ok(DataUsageProfile::Profile1),
            "100 MB" => Ok(DataUsageProfile::Profile2),
            "250 MB" => Ok(DataUsageProfile::Profile3),
            "500 MB" => Ok(DataUsageProfile::Profile4),
            "Unlimited" => Ok(DataUsageProfile::Unlimited),
            other => Err(ResourceError::InvalidDataLimit(other.to_string())),
        }
    }
    
    pub fn label(self) -> &'static str {
        match self {
            DataUsageProfile::Profile1 => "50 MB",
            DataUsageProfile::Profile2 => "100 MB",
            DataUsageProfile::Profile3 => "250 MB",
            DataUsageProfile::Profile4 => "500 MB",
            DataUsageProfile::Unlimited => "Unlimited",
        }
    }
    
    /// Monthly allowance in bytes; `None` for unlimited
    pub fn limit_bytes(self) -> Option<i64> {
        const MB: i64 = 1024 * 1024;
        match self {
            DataUsageProfile::Profile1 => Some(50 * MB),
            DataUsageProfile::Profile2 => Some(100 * MB),
            DataUsageProfile::Profile3 => Some(250 * MB),
            DataUsageProfile::Profile4 => Some(500 * MB),
            DataUsageProfile::Unlimited => None,
        }
    }
    
    /// Schedule parameter that scales a task's interval under this profile
    pub fn frequency_param(self) -> &'static str {
        match self {
            DataUsageProfile::Profile1 => "profile_1_freq",
            DataUsageProfile::Profile2 => "profile_2_freq",
            DataUsageProfile::Profile3 => "profile_3_freq",
            DataUsageProfile::Profile4 => "profile_4_freq",
            DataUsageProfile::Unlimited => "profile_unlimited",
        }
    }
}

impl Default for DataUsageProfile {
    fn default() -> Self {
        DataUsageProfile::Profile3
    }
}

#[derive(Debug, Clone, Copy)]
struct Policy {
    battery_threshold: u8,
    profile: DataUsageProfile,
    period_days: u32,
}

/// The persisted usage record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecord {
    pub period_start: i64,
    pub bytes_used: i64,
}

pub struct ResourceCapManager {
    policy: RwLock<Policy>,
    usage_path: PathBuf,
    usage_lock: Mutex<()>,
    device: Arc<dyn DeviceInfoProvider>,
    clock: SharedClock,
}

impl ResourceCapManager {
    pub fn new<P: AsRef<Path>>(
        data_dir: P,
        battery_threshold: u8,
        profile: DataUsageProfile,
        period_days: u32,
        device: Arc<dyn DeviceInfoProvider>,
        clock: SharedClock,
    ) -> Result<Self, ResourceError> {
        if battery_threshold > 100 {
            return Err(ResourceError::InvalidThreshold(battery_threshold as i64));
        }
        Ok(Self {
            policy: RwLock::new(Policy {
                battery_threshold,
                profile,
                period_days: period_days.max(1),
            }),
            usage_path: data_dir.as_ref().join(USAGE_FILE_NAME),
            usage_lock: Mutex::new(()),
            device,
            clock,
        })
    }
    
    fn policy(&self) -> Policy {
        *self.policy.read().unwrap_or_else(|e| e.into_inner())
    }
    
    pub fn battery_threshold(&self) -> u8 {
        self.policy().battery_threshold
    }
    
    /// Out-of-range thresholds are rejected and the old value kept
    pub fn set_battery_threshold(&self, threshold: i64) -> Result<(), ResourceError> {
        if !(0..=100).contains(&threshold) {
            warn!("Rejecting battery threshold {}", threshold);
            return Err(ResourceError::InvalidThreshold(threshold));
        }
        let mut policy = self.policy.write().unwrap_or_else(|e| e.into_inner());
        policy.battery_threshold = threshold as u8;
        info!("Battery threshold set to {}%", threshold);
        Ok(())
    }
    
    pub fn data_profile(&self) -> DataUsageProfile {
        self.policy().profile
    }
    
    pub fn set_data_profile(&self, profile: DataUsageProfile) {
        let mut policy = self.policy.write().unwrap_or_else(|e| e.into_inner());
        policy.profile = profile;
        info!("Data limit set to {}", profile.label());
    }
    
    /// Charging, or battery strictly above the threshold
    pub fn can_schedule_experiment(&self) -> bool {
        self.device.is_charging() || self.device.battery_level() > self.policy().battery_threshold
    }
    
    /// Budget for one period in bytes
    fn period_budget(policy: &Policy) -> Option<i64> {
        policy
            .profile
            .limit_bytes()
            .map(|limit| limit * policy.period_days as i64 / 30)
    }
    
    pub fn is_over_data_limit(&self, kind: MeasurementKind) -> Result<bool, ResourceError> {
        let policy = self.policy();
        let Some(budget) = Self::period_budget(&policy) else {
            debug!("No data limit");
            return Ok(false);
        };
        
        let _guard = self.usage_lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        let Some(record) = self.read_record()? else {
            // Missing record starts a fresh period
            self.write_record(UsageRecord {
                period_start: now.timestamp(),
                bytes_used: 0,
            })?;
            return Ok(false);
        };
        
        let record = self.roll(record, &policy, now)?;
        let over = record.bytes_used >= budget;
        debug!(
            "Data check for {}: used {} of {} bytes this period",
            kind, record.bytes_used, budget
        );
        if over {
            info!("Exceeded data limit: {} >= {} ({})", record.bytes_used, budget, policy.profile.label());
        }
        Ok(over)
    }
    
    /// Add consumed bytes to the current period
    pub fn update_data_usage(&self, bytes: u64) -> Result<(), ResourceError> {
        let policy = self.policy();
        let _guard = self.usage_lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        let bytes = bytes.min(i64::MAX as u64) as i64;
        
        let record = match self.read_record()? {
            Some(record) => UsageRecord {
                bytes_used: record.bytes_used.saturating_add(bytes),
                ..record
            },
            None => UsageRecord {
                period_start: now.timestamp(),
                bytes_used: bytes,
            },
        };
        debug!("Data usage +{} bytes, now {}", bytes, record.bytes_used);
        
        let rolled = self.advance(record, &policy, now);
        self.write_record(rolled)
    }
    
    /// Current record, rolled forward to the current period
    pub fn usage(&self) -> Result<Option<UsageRecord>, ResourceError> {
        let policy = self.policy();
        let _guard = self.usage_lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.read_record()? {
            Some(record) => Ok(Some(self.roll(record, &policy, self.clock.now())?)),
            None => Ok(None),
        }
    }
    
    fn roll(&self, record: UsageRecord, policy: &Policy, now: DateTime<Utc>) -> Result<UsageRecord, ResourceError> {
        let rolled = self.advance(record, policy, now);
        if rolled != record {
            self.write_record(rolled)?;
        }
        Ok(rolled)
    }
    
    /// Move the record into the period containing `now`. A period includes
    /// its closing second. Each elapsed period's budget is subtracted from
    /// the usage; the resulting credit is capped at one period's budget.
    fn advance(&self, record: UsageRecord, policy: &Policy, now: DateTime<Utc>) -> UsageRecord {
        let period_sec = policy.period_days as i64 * 24 * 3600;
        let elapsed = now.timestamp() - record.period_start;
        if elapsed <= period_sec {
            return record;
        }
        let periods = (elapsed - 1) / period_sec;
        let budget = Self::period_budget(policy).unwrap_or(0);
        let bytes_used = record
            .bytes_used
            .saturating_sub(periods.saturating_mul(budget))
            .max(-budget);
        info!("Data usage period rolled over {} period(s), carried {} bytes", periods, bytes_used);
        UsageRecord {
            period_start: record.period_start + periods * period_sec,
            bytes_used,
        }
    }
    
    fn read_record(&self) -> Result<Option<UsageRecord>, ResourceError> {
        let contents = match std::fs::read_to_string(&self.usage_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match parse_record(&contents) {
            Some(record) => Ok(Some(record)),
            None => {
                warn!("Corrupt data usage file {:?}, starting over", self.usage_path);
                Ok(None)
            }
        }
    }
    
    fn write_record(&self, record: UsageRecord) -> Result<(), ResourceError> {
        if let Some(dir) = self.usage_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.usage_path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}_{}", record.period_start, record.bytes_used))?;
        std::fs::rename(&tmp, &self.usage_path)?;
        Ok(())
    }
}

fn parse_record(contents: &str) -> Option<UsageRecord> {
    let (start, used) = contents.trim().split_once('_')?;
    Some(UsageRecord {
        period_start: start.parse().ok()?,
        bytes_used: used.parse().ok()?,
    })
}
