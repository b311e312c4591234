//! System probes
//!
//! Every live reading the resource layer needs (core counts, RAM, CPU load,
//! GPU, process RSS) goes through [`SystemProbe`]. The default
//! [`SysinfoProbe`] queries the OS; [`StaticProbe`] returns fixed values and
//! is what tests and embedders use to drive tiers and pressure
//! deterministically.

use crate::MIB;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::process::Command;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Environment override for GPU VRAM in MiB (`0` disables GPU detection).
pub const GPU_VRAM_ENV: &str = "NARRATIVE_GPU_VRAM_MB";

/// Detected GPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub vram_total_mb: u64,
    pub vram_available_mb: u64,
}

impl GpuInfo {
    pub fn new(name: impl Into<String>, vram_total_mb: u64) -> Self {
        Self {
            name: name.into(),
            vram_total_mb,
            vram_available_mb: vram_total_mb,
        }
    }
}

/// Static hardware facts (do not change during a run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareFacts {
    pub cpu_cores_logical: usize,
    pub cpu_cores_physical: usize,
    pub ram_total_mb: u64,
    pub gpu: Option<GpuInfo>,
}

/// Instantaneous RAM reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total_mb: u64,
    pub available_mb: u64,
}

impl MemoryUsage {
    /// Percentage of RAM in use (0.0 when total is unknown).
    pub fn percent_used(&self) -> f64 {
        if self.total_mb == 0 {
            return 0.0;
        }
        let used = self.total_mb.saturating_sub(self.available_mb);
        used as f64 * 100.0 / self.total_mb as f64
    }
}

/// Source of live system readings.
pub trait SystemProbe: Send + Sync {
    fn hardware(&self) -> HardwareFacts;

    fn memory(&self) -> MemoryUsage;

    /// Global CPU utilisation in percent, sampled now.
    fn cpu_percent(&self) -> f32;

    /// Resident set size of this process in bytes, `None` when unavailable.
    fn process_rss_bytes(&self) -> Option<u64>;
}

// ═══════════════════════════════════════════════════════════
// sysinfo-backed probe
// ═══════════════════════════════════════════════════════════

/// Probe backed by `sysinfo` (RAM, CPU, RSS) and `nvidia-smi` (GPU).
///
/// CPU sampling has its own `System` so the wait between its two refreshes
/// never delays memory or RSS readings.
pub struct SysinfoProbe {
    system: Mutex<System>,
    cpu: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let mut cpu = System::new();
        cpu.refresh_cpu_usage();

        Self {
            system: Mutex::new(system),
            cpu: Mutex::new(cpu),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn hardware(&self) -> HardwareFacts {
        let ram_total_mb = {
            let mut system = self.system.lock();
            system.refresh_memory();
            system.total_memory() / MIB
        };

        HardwareFacts {
            cpu_cores_logical: num_cpus::get().max(1),
            cpu_cores_physical: num_cpus::get_physical().max(1),
            ram_total_mb,
            gpu: detect_gpu(),
        }
    }

    fn memory(&self) -> MemoryUsage {
        let mut system = self.system.lock();
        system.refresh_memory();
        MemoryUsage {
            total_mb: system.total_memory() / MIB,
            available_mb: system.available_memory() / MIB,
        }
    }

    fn cpu_percent(&self) -> f32 {
        // Usage is a delta between two refreshes; no lock is held across the wait
        self.cpu.lock().refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);

        let mut cpu = self.cpu.lock();
        cpu.refresh_cpu_usage();
        cpu.global_cpu_usage()
    }

    fn process_rss_bytes(&self) -> Option<u64> {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(e) => {
                debug!("RSS unavailable: {}", e);
                return None;
            }
        };

        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory())
    }
}

/// Best-effort GPU detection.
///
/// `NARRATIVE_GPU_VRAM_MB` wins when set; otherwise `nvidia-smi` is queried.
fn detect_gpu() -> Option<GpuInfo> {
    if let Ok(raw) = std::env::var(GPU_VRAM_ENV) {
        return match raw.trim().parse::<u64>() {
            Ok(0) => None,
            Ok(vram) => Some(GpuInfo::new("configured GPU", vram)),
            Err(e) => {
                warn!("Ignoring invalid {}='{}': {}", GPU_VRAM_ENV, raw, e);
                None
            }
        };
    }

    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

/// Parse the first line of `nvidia-smi --query-gpu=name,memory.total,memory.free`.
fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.split(',').map(str::trim);

    let name = fields.next()?.to_string();
    let total = fields.next()?.parse::<u64>().ok()?;
    let free = fields
        .next()
        .and_then(|f| f.parse::<u64>().ok())
        .unwrap_or(total);

    Some(GpuInfo {
        name,
        vram_total_mb: total,
        vram_available_mb: free,
    })
}

// ═══════════════════════════════════════════════════════════
// Static probe
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct StaticState {
    hardware: HardwareFacts,
    available_mb: u64,
    cpu_percent: f32,
    rss_bytes: Option<u64>,
}

/// Probe returning caller-controlled values.
///
/// Readings can be changed while the probe is shared, which lets a test
/// simulate pressure appearing or a relief hook freeing memory.
pub struct StaticProbe {
    state: Mutex<StaticState>,
}

impl StaticProbe {
    pub fn new(physical_cores: usize, ram_total_mb: u64, gpu: Option<GpuInfo>) -> Self {
        Self {
            state: Mutex::new(StaticState {
                hardware: HardwareFacts {
                    cpu_cores_logical: physical_cores * 2,
                    cpu_cores_physical: physical_cores,
                    ram_total_mb,
                    gpu,
                },
                available_mb: ram_total_mb / 2,
                cpu_percent: 10.0,
                rss_bytes: Some(256 * MIB),
            }),
        }
    }

    pub fn with_available_mb(self, available_mb: u64) -> Self {
        self.set_available_mb(available_mb);
        self
    }

    pub fn set_available_mb(&self, available_mb: u64) {
        let mut state = self.state.lock();
        state.available_mb = available_mb.min(state.hardware.ram_total_mb);
    }

    pub fn set_cpu_percent(&self, percent: f32) {
        self.state.lock().cpu_percent = percent;
    }

    pub fn set_gpu(&self, gpu: Option<GpuInfo>) {
        self.state.lock().hardware.gpu = gpu;
    }

    pub fn set_rss_mb(&self, rss_mb: Option<u64>) {
        self.state.lock().rss_bytes = rss_mb.map(|mb| mb * MIB);
    }

    /// Set RAM usage as a percentage of total.
    pub fn set_ram_percent_used(&self, percent: f64) {
        let mut state = self.state.lock();
        let total = state.hardware.ram_total_mb as f64;
        let used = (total * percent.clamp(0.0, 100.0) / 100.0).round();
        state.available_mb = (total - used).max(0.0) as u64;
    }
}

impl SystemProbe for StaticProbe {
    fn hardware(&self) -> HardwareFacts {
        self.state.lock().hardware.clone()
    }

    fn memory(&self) -> MemoryUsage {
        let state = self.state.lock();
        MemoryUsage {
            total_mb: state.hardware.ram_total_mb,
            available_mb: state.available_mb,
        }
    }

    fn cpu_percent(&self) -> f32 {
        self.state.lock().cpu_percent
    }

    fn process_rss_bytes(&self) -> Option<u64> {
        self.state.lock().rss_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi_line() {
        let gpu = parse_nvidia_smi("NVIDIA GeForce RTX 3080, 10240, 9800\n").unwrap();
        assert_eq!(gpu.name, "NVIDIA GeForce RTX 3080");
        assert_eq!(gpu.vram_total_mb, 10240);
        assert_eq!(gpu.vram_available_mb, 9800);
    }

    #[test]
    fn test_parse_nvidia_smi_garbage() {
        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("No devices were found").is_none());
    }

    #[test]
    fn test_memory_reading_not_blocked_by_cpu_sampling() {
        let probe = std::sync::Arc::new(SysinfoProbe::new());
        let sampler = {
            let probe = probe.clone();
            std::thread::spawn(move || probe.cpu_percent())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));

        let started = std::time::Instant::now();
        let _ = probe.memory();
        let _ = probe.process_rss_bytes();
        assert!(started.elapsed() < sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);

        let cpu = sampler.join().unwrap();
        assert!(cpu >= 0.0);
    }

    #[test]
    fn test_memory_percent_used() {
        let usage = MemoryUsage {
            total_mb: 1000,
            available_mb: 250,
        };
        assert!((usage.percent_used() - 75.0).abs() < f64::EPSILON);

        let unknown = MemoryUsage {
            total_mb: 0,
            available_mb: 0,
        };
        assert_eq!(unknown.percent_used(), 0.0);
    }

    #[test]
    fn test_static_probe_ram_percent() {
        let probe = StaticProbe::new(4, 8192, None);
        probe.set_ram_percent_used(90.0);
        let usage = probe.memory();
        assert!((usage.percent_used() - 90.0).abs() < 0.1);
    }

    #[test]
    fn test_sysinfo_probe_reports_something() {
        let probe = SysinfoProbe::new();
        let hw = probe.hardware();
        assert!(hw.cpu_cores_logical >= 1);
        assert!(hw.cpu_cores_physical >= 1);
    }
}
