//! Measurement outcome errors

use thiserror::Error;

/// Why a task was not run. Skips are policy decisions, not failures:
/// they are never uploaded and never shown as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Paused,
    LowBattery,
    OverDataLimit,
    UnwantedNetwork,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::Paused => "scheduler is paused",
            SkipReason::LowBattery => "battery below threshold",
            SkipReason::OverDataLimit => "over data limit",
            SkipReason::UnwantedNetwork => "not on the requested network type",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeasurementError {
    #[error("Measurement skipped: {0}")]
    Skipped(SkipReason),
    
    #[error("{0}")]
    Failed(String),
    
    #[error("Deadline passed before execution")]
    DeadlineExpired,
    
    #[error("Task cancelled")]
    Cancelled,
    
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    
    #[error("Unknown measurement type: {0}")]
    UnknownMeasurementType(String),
}

impl MeasurementError {
    pub fn failed(msg: impl Into<String>) -> Self {
        MeasurementError::Failed(msg.into())
    }
    
    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        MeasurementError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
    
    pub fn is_skip(&self) -> bool {
        matches!(self, MeasurementError::Skipped(_))
    }
}
