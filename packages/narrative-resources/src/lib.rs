/*
 * Narrative Resources - process-wide resource substrate
 *
 * Hardware detection, concurrency advice and memory accounting for the
 * manuscript analysis pipeline.
 *
 * Architecture:
 * - SystemProbe (live CPU/RAM/GPU/RSS readings, injectable)
 * - ResourceManager (tier, recommendation, pressure, relief)
 * - HeavyTaskSemaphore (bounded expensive operations)
 * - MemoryMonitor (per-run RSS history, peak, per-stage deltas)
 */

pub mod capabilities;
pub mod error;
pub mod manager;
pub mod memory;
pub mod pressure;
pub mod probe;
pub mod semaphore;

pub use capabilities::{
    classify_tier, generate_recommendation, ResourceRecommendation, ResourceTier,
    SystemCapabilities,
};
pub use error::{ResourceError, Result};
pub use manager::{ResourceManager, ResourceStatus};
pub use memory::{MemoryMonitor, MemoryReport, MemorySnapshot, PhaseGuard};
pub use pressure::{MemoryPressure, PressureThresholds, ReliefIntensity, ReliefOutcome};
pub use probe::{GpuInfo, HardwareFacts, MemoryUsage, StaticProbe, SysinfoProbe, SystemProbe};
pub use semaphore::{HeavyTaskPermit, HeavyTaskSemaphore, HEAVY_TASKS};

/// Bytes per mebibyte.
pub const MIB: u64 = 1024 * 1024;
