//! Capability classification and concurrency advice.
//!
//! Pure functions from detected hardware to a [`ResourceTier`] and a
//! [`ResourceRecommendation`]. No I/O; the manager feeds them probe
//! readings.

use crate::probe::{GpuInfo, HardwareFacts, MemoryUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ═══════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════

/// VRAM below this is "low VRAM" (MiB).
pub const LOW_VRAM_THRESHOLD_MB: u64 = 6 * 1024;

const HIGH_TIER_MIN_CORES: usize = 8;
const HIGH_TIER_MIN_RAM_MB: u64 = 16 * 1024;
const MEDIUM_TIER_MIN_CORES: usize = 4;
const MEDIUM_TIER_MIN_RAM_MB: u64 = 8 * 1024;

/// Available RAM budgeted per worker (MiB).
const RAM_PER_WORKER_MB: u64 = 2048;
const MAX_WORKERS_CEILING: usize = 8;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Coarse hardware classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTier {
    /// < 4 cores or < 8 GiB RAM
    Low,
    /// ≥ 4 cores and ≥ 8 GiB RAM
    Medium,
    /// ≥ 8 cores, ≥ 16 GiB RAM and a GPU with ≥ 6 GiB VRAM
    High,
}

impl ResourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceTier::Low => "low",
            ResourceTier::Medium => "medium",
            ResourceTier::High => "high",
        }
    }
}

impl fmt::Display for ResourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Detected system capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCapabilities {
    pub cpu_cores_logical: usize,
    pub cpu_cores_physical: usize,
    pub cpu_percent: f32,

    pub ram_total_mb: u64,
    pub ram_available_mb: u64,
    pub ram_percent_used: f64,

    pub gpu: Option<GpuInfo>,
    pub gpu_is_low_vram: bool,

    pub tier: ResourceTier,
    pub detected_at: DateTime<Utc>,
}

impl SystemCapabilities {
    pub fn from_readings(hardware: HardwareFacts, memory: MemoryUsage, cpu_percent: f32) -> Self {
        let gpu_is_low_vram = hardware
            .gpu
            .as_ref()
            .map_or(true, |g| g.vram_total_mb < LOW_VRAM_THRESHOLD_MB);
        let tier = classify_tier(
            hardware.cpu_cores_physical,
            hardware.ram_total_mb,
            hardware.gpu.as_ref(),
        );

        Self {
            cpu_cores_logical: hardware.cpu_cores_logical,
            cpu_cores_physical: hardware.cpu_cores_physical,
            cpu_percent,
            ram_total_mb: hardware.ram_total_mb,
            ram_available_mb: memory.available_mb,
            ram_percent_used: memory.percent_used(),
            gpu: hardware.gpu,
            gpu_is_low_vram,
            tier,
            detected_at: Utc::now(),
        }
    }

    pub fn gpu_available(&self) -> bool {
        self.gpu.is_some()
    }
}

/// Derived concurrency and batching advice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecommendation {
    pub max_workers: usize,
    pub batch_size_embeddings: usize,
    pub batch_size_nlp: usize,
    pub use_gpu_for_embeddings: bool,
    pub use_gpu_for_nlp: bool,
    pub max_concurrent_heavy_tasks: usize,
    pub chunk_large_documents: bool,
    /// Characters per chunk when chunking large documents.
    pub document_chunk_size: usize,
}

impl Default for ResourceRecommendation {
    fn default() -> Self {
        Self {
            max_workers: 2,
            batch_size_embeddings: 16,
            batch_size_nlp: 100,
            use_gpu_for_embeddings: false,
            use_gpu_for_nlp: false,
            max_concurrent_heavy_tasks: 1,
            chunk_large_documents: false,
            document_chunk_size: 50_000,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Classification logic
// ═══════════════════════════════════════════════════════════

/// Classify hardware into a tier.
pub fn classify_tier(physical_cores: usize, ram_total_mb: u64, gpu: Option<&GpuInfo>) -> ResourceTier {
    let strong_gpu = gpu.map_or(false, |g| g.vram_total_mb >= LOW_VRAM_THRESHOLD_MB);

    if physical_cores >= HIGH_TIER_MIN_CORES && ram_total_mb >= HIGH_TIER_MIN_RAM_MB && strong_gpu {
        return ResourceTier::High;
    }

    if physical_cores >= MEDIUM_TIER_MIN_CORES && ram_total_mb >= MEDIUM_TIER_MIN_RAM_MB {
        return ResourceTier::Medium;
    }

    ResourceTier::Low
}

/// Worker ceiling: `clamp(min(physical - 1, available / 2 GiB), 1, 8)`.
pub fn max_workers_for(physical_cores: usize, ram_available_mb: u64) -> usize {
    let cores_based = physical_cores.saturating_sub(1);
    let ram_based = usize::try_from(ram_available_mb / RAM_PER_WORKER_MB).unwrap_or(usize::MAX);
    cores_based.min(ram_based).clamp(1, MAX_WORKERS_CEILING)
}

/// Derive recommendations from capabilities.
pub fn generate_recommendation(caps: &SystemCapabilities) -> ResourceRecommendation {
    let mut rec = ResourceRecommendation {
        max_workers: max_workers_for(caps.cpu_cores_physical, caps.ram_available_mb),
        ..Default::default()
    };

    match (&caps.gpu, caps.gpu_is_low_vram) {
        (Some(_), false) => {
            rec.use_gpu_for_embeddings = true;
            rec.batch_size_embeddings = 64;
        }
        (Some(_), true) => {
            // Small GPU: fine for the NLP models, not for embeddings
            rec.use_gpu_for_nlp = true;
            rec.batch_size_embeddings = 32;
        }
        (None, _) => {
            rec.batch_size_embeddings = 16;
        }
    }

    rec.max_concurrent_heavy_tasks = match caps.tier {
        ResourceTier::High => 2,
        ResourceTier::Medium | ResourceTier::Low => 1,
    };

    if caps.ram_available_mb < 4096 {
        rec.chunk_large_documents = true;
        rec.document_chunk_size = 30_000;
    } else if caps.ram_available_mb < 8192 {
        rec.document_chunk_size = 50_000;
    } else {
        rec.document_chunk_size = 100_000;
    }

    rec.batch_size_nlp = if caps.ram_available_mb >= 8192 {
        200
    } else if caps.ram_available_mb >= 4096 {
        100
    } else {
        50
    };

    rec
}
