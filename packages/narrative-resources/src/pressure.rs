//! Memory pressure levels and relief hooks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// System memory pressure, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Ok,
    Warning,
    Critical,
    Danger,
}

impl MemoryPressure {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPressure::Ok => "ok",
            MemoryPressure::Warning => "warning",
            MemoryPressure::Critical => "critical",
            MemoryPressure::Danger => "danger",
        }
    }
}

impl fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// RAM-used percentages at which each level starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureThresholds {
    pub warning_percent: f64,
    pub critical_percent: f64,
    pub danger_percent: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            warning_percent: 75.0,
            critical_percent: 85.0,
            danger_percent: 95.0,
        }
    }
}

impl PressureThresholds {
    pub fn classify(&self, ram_percent_used: f64) -> MemoryPressure {
        if ram_percent_used >= self.danger_percent {
            MemoryPressure::Danger
        } else if ram_percent_used >= self.critical_percent {
            MemoryPressure::Critical
        } else if ram_percent_used >= self.warning_percent {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Ok
        }
    }
}

/// When a relief hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReliefIntensity {
    /// Runs on every relief pass.
    Normal,
    /// Runs only on aggressive passes (e.g. dropping loaded models).
    Aggressive,
}

/// A registered reclaim callback. Returns the bytes it believes it freed.
pub(crate) struct ReliefHook {
    pub(crate) name: String,
    pub(crate) intensity: ReliefIntensity,
    pub(crate) reclaim: Box<dyn Fn() -> u64 + Send + Sync>,
}

/// Result of one relief pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliefOutcome {
    pub aggressive: bool,
    pub hooks_run: Vec<String>,
    pub bytes_reported: u64,
    pub pressure_before: MemoryPressure,
    pub pressure_after: MemoryPressure,
}

impl ReliefOutcome {
    pub fn improved(&self) -> bool {
        self.pressure_after < self.pressure_before
    }
}
