use crate::capabilities::{generate_recommendation, ResourceRecommendation, SystemCapabilities};
use crate::error::Result;
use crate::pressure::{MemoryPressure, PressureThresholds, ReliefHook, ReliefIntensity, ReliefOutcome};
use crate::probe::{SysinfoProbe, SystemProbe};
use crate::semaphore::{is_heavy_task, HeavyTaskSemaphore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// CPU load above which the system counts as under pressure (percent).
const CPU_PRESSURE_PERCENT: f32 = 80.0;
/// RAM usage above which the system counts as under pressure (percent).
const RAM_PRESSURE_PERCENT: f64 = 85.0;

static SHARED: OnceLock<Arc<ResourceManager>> = OnceLock::new();

/// Live resource status (diagnostics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub capabilities: SystemCapabilities,
    pub recommendation: ResourceRecommendation,
    pub cpu_percent: f32,
    pub ram_available_mb: u64,
    pub ram_percent_used: f64,
    pub memory_pressure: MemoryPressure,
    pub system_under_pressure: bool,
    pub available_workers: usize,
    pub heavy_tasks_active: Vec<String>,
    pub heavy_tasks_slots_available: usize,
}

struct Detected {
    capabilities: SystemCapabilities,
    recommendation: ResourceRecommendation,
}

/// Hardware-aware resource manager.
///
/// Built once per process (see [`ResourceManager::shared`]) or explicitly
/// with an injected probe, then handed around as `Arc<ResourceManager>`.
pub struct ResourceManager {
    probe: Arc<dyn SystemProbe>,
    thresholds: PressureThresholds,
    detected: RwLock<Detected>,
    semaphore: Arc<HeavyTaskSemaphore>,
    relief_hooks: Mutex<Vec<ReliefHook>>,
}

impl ResourceManager {
    /// Manager backed by live OS readings.
    pub fn new() -> Self {
        Self::with_probe(Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(probe: Arc<dyn SystemProbe>) -> Self {
        let detected = Self::detect(probe.as_ref());
        let semaphore = HeavyTaskSemaphore::new(detected.recommendation.max_concurrent_heavy_tasks);

        Self {
            probe,
            thresholds: PressureThresholds::default(),
            detected: RwLock::new(detected),
            semaphore: Arc::new(semaphore),
            relief_hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_thresholds(mut self, thresholds: PressureThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Process-wide instance, initialised on first use.
    pub fn shared() -> Arc<ResourceManager> {
        SHARED
            .get_or_init(|| {
                debug!("Initialising shared ResourceManager");
                Arc::new(ResourceManager::new())
            })
            .clone()
    }

    pub fn probe(&self) -> Arc<dyn SystemProbe> {
        self.probe.clone()
    }

    fn detect(probe: &dyn SystemProbe) -> Detected {
        let capabilities =
            SystemCapabilities::from_readings(probe.hardware(), probe.memory(), probe.cpu_percent());
        let recommendation = generate_recommendation(&capabilities);

        info!(
            "System detected: {} - CPU: {}c/{}t, RAM: {}MB/{}MB, GPU: {}",
            capabilities.tier,
            capabilities.cpu_cores_physical,
            capabilities.cpu_cores_logical,
            capabilities.ram_available_mb,
            capabilities.ram_total_mb,
            capabilities.gpu.as_ref().map_or("N/A", |g| g.name.as_str()),
        );
        debug!("Recommendation: {:?}", recommendation);

        Detected {
            capabilities,
            recommendation,
        }
    }

    /// Re-detect capabilities and recompute recommendations.
    pub fn refresh_capabilities(&self) -> SystemCapabilities {
        let detected = Self::detect(self.probe.as_ref());
        let max_heavy = detected.recommendation.max_concurrent_heavy_tasks;
        let capabilities = detected.capabilities.clone();

        *self.detected.write() = detected;
        self.semaphore.set_max_concurrent(max_heavy);

        capabilities
    }

    pub fn get_capabilities(&self) -> SystemCapabilities {
        self.detected.read().capabilities.clone()
    }

    pub fn get_recommendation(&self) -> ResourceRecommendation {
        self.detected.read().recommendation.clone()
    }

    pub fn heavy_task_semaphore(&self) -> Arc<HeavyTaskSemaphore> {
        self.semaphore.clone()
    }

    /// CPU > 80 % or RAM > 85 %, sampled now.
    pub fn is_system_under_pressure(&self) -> bool {
        let cpu = self.probe.cpu_percent();
        let ram = self.probe.memory().percent_used();
        cpu > CPU_PRESSURE_PERCENT || ram > RAM_PRESSURE_PERCENT
    }

    /// Recommended workers, halved (floor 1) while under pressure.
    pub fn get_available_workers(&self) -> usize {
        let base = self.get_recommendation().max_workers;

        if self.is_system_under_pressure() {
            let reduced = (base / 2).max(1);
            debug!("System under pressure: workers {} -> {}", base, reduced);
            return reduced;
        }

        base
    }

    pub fn check_memory_pressure(&self) -> MemoryPressure {
        self.thresholds.classify(self.probe.memory().percent_used())
    }

    /// Register a callback run by [`relieve_memory_pressure`](Self::relieve_memory_pressure).
    pub fn register_relief_hook<F>(&self, name: impl Into<String>, intensity: ReliefIntensity, reclaim: F)
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.relief_hooks.lock().push(ReliefHook {
            name: name.into(),
            intensity,
            reclaim: Box::new(reclaim),
        });
    }

    /// One best-effort reclaim pass. Normal hooks always run; aggressive
    /// hooks only when `aggressive` is set.
    pub fn relieve_memory_pressure(&self, aggressive: bool) -> ReliefOutcome {
        let pressure_before = self.check_memory_pressure();
        let mut hooks_run = Vec::new();
        let mut bytes_reported: u64 = 0;

        {
            let hooks = self.relief_hooks.lock();
            for hook in hooks.iter() {
                if hook.intensity == ReliefIntensity::Aggressive && !aggressive {
                    continue;
                }
                let freed = (hook.reclaim)();
                bytes_reported = bytes_reported.saturating_add(freed);
                hooks_run.push(hook.name.clone());
            }
        }

        let pressure_after = self.check_memory_pressure();
        if pressure_after >= MemoryPressure::Critical {
            warn!(
                "Memory relief ({}) ran {} hooks, pressure {} -> {}",
                if aggressive { "aggressive" } else { "normal" },
                hooks_run.len(),
                pressure_before,
                pressure_after
            );
        } else {
            debug!(
                "Memory relief ran {} hooks, pressure {} -> {}",
                hooks_run.len(),
                pressure_before,
                pressure_after
            );
        }

        ReliefOutcome {
            aggressive,
            hooks_run,
            bytes_reported,
            pressure_before,
            pressure_after,
        }
    }

    /// Non-heavy tasks can always run; heavy tasks need a free slot.
    pub fn can_run_heavy_task(&self, task: &str) -> bool {
        if !is_heavy_task(task) {
            return true;
        }
        self.heavy_task_semaphore().available_slots() > 0
    }

    /// Run `f`, throttled by the heavy-task semaphore when `task` is on the
    /// allow-list. The slot is released however `f` exits.
    pub fn run_heavy_task<T, F>(&self, task: &str, f: F, timeout: Option<Duration>) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        if !is_heavy_task(task) {
            return Ok(f());
        }

        let semaphore = self.heavy_task_semaphore();
        let _permit = semaphore.acquire(task, timeout)?;
        Ok(f())
    }

    pub fn get_status(&self) -> ResourceStatus {
        let memory = self.probe.memory();
        let cpu_percent = self.probe.cpu_percent();
        let semaphore = self.heavy_task_semaphore();

        ResourceStatus {
            capabilities: self.get_capabilities(),
            recommendation: self.get_recommendation(),
            cpu_percent,
            ram_available_mb: memory.available_mb,
            ram_percent_used: memory.percent_used(),
            memory_pressure: self.thresholds.classify(memory.percent_used()),
            system_under_pressure: self.is_system_under_pressure(),
            available_workers: self.get_available_workers(),
            heavy_tasks_active: semaphore.active_tasks(),
            heavy_tasks_slots_available: semaphore.available_slots(),
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}
