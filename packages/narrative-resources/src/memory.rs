//! Per-run memory accounting.
//!
//! The monitor keeps an append-only list of timestamped RSS readings for the
//! current run. Peak, per-stage deltas and threshold breaches are derived
//! from that list on demand; nothing is stored twice.

use crate::probe::SystemProbe;
use crate::MIB;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_WARNING_THRESHOLD_MB: u64 = 2048;

pub const START_LABEL: &str = "start";
pub const END_LABEL: &str = "end";

/// One RSS reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub stage: String,
    pub label: String,
    /// `None` when the platform gave no reading.
    pub rss_mb: Option<f64>,
    /// Change since the previous available reading.
    pub delta_mb: Option<f64>,
    pub taken_at: DateTime<Utc>,
}

/// Accumulated history for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryReport {
    pub snapshots: Vec<MemorySnapshot>,
    pub peak_mb: Option<f64>,
    /// `end - start` RSS per stage, for stages with both readings.
    pub stage_deltas_mb: BTreeMap<String, f64>,
    pub threshold_mb: u64,
    /// Snapshots whose RSS exceeded the threshold.
    pub threshold_breaches: usize,
}

pub struct MemoryMonitor {
    probe: Arc<dyn SystemProbe>,
    warning_threshold_mb: u64,
    snapshots: Mutex<Vec<MemorySnapshot>>,
}

impl MemoryMonitor {
    pub fn new(probe: Arc<dyn SystemProbe>) -> Self {
        Self::with_threshold(probe, DEFAULT_WARNING_THRESHOLD_MB)
    }

    pub fn with_threshold(probe: Arc<dyn SystemProbe>, warning_threshold_mb: u64) -> Self {
        Self {
            probe,
            warning_threshold_mb,
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn warning_threshold_mb(&self) -> u64 {
        self.warning_threshold_mb
    }

    /// Record a reading. Never fails: a missing measurement facility yields
    /// a snapshot with `rss_mb == None`.
    pub fn snapshot(&self, stage: &str, label: &str) -> MemorySnapshot {
        let rss_mb = self.probe.process_rss_bytes().map(|b| b as f64 / MIB as f64);

        let mut snapshots = self.snapshots.lock();
        let previous = snapshots.iter().rev().find_map(|s| s.rss_mb);
        let delta_mb = match (rss_mb, previous) {
            (Some(now), Some(before)) => Some(now - before),
            _ => None,
        };

        let snap = MemorySnapshot {
            stage: stage.to_string(),
            label: label.to_string(),
            rss_mb,
            delta_mb,
            taken_at: Utc::now(),
        };
        snapshots.push(snap.clone());
        drop(snapshots);

        match rss_mb {
            Some(rss) if rss > self.warning_threshold_mb as f64 => {
                warn!(
                    "Memory above threshold at {}/{}: {:.0}MB > {}MB",
                    stage, label, rss, self.warning_threshold_mb
                );
            }
            Some(rss) => debug!("Memory {}/{}: {:.1}MB", stage, label, rss),
            None => debug!("Memory {}/{}: unavailable", stage, label),
        }

        snap
    }

    /// Take a "start" snapshot now and an "end" snapshot when the guard goes
    /// away, whether the tracked work returns normally or unwinds.
    pub fn track_phase(&self, stage: &str) -> PhaseGuard<'_> {
        let start = self.snapshot(stage, START_LABEL);
        PhaseGuard {
            monitor: self,
            stage: stage.to_string(),
            start_rss_mb: start.rss_mb,
            finished: false,
        }
    }

    pub fn get_report(&self) -> MemoryReport {
        let snapshots = self.snapshots.lock().clone();

        let peak_mb = snapshots
            .iter()
            .filter_map(|s| s.rss_mb)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));

        let mut starts: BTreeMap<&str, f64> = BTreeMap::new();
        let mut stage_deltas_mb = BTreeMap::new();
        for snap in &snapshots {
            let Some(rss) = snap.rss_mb else { continue };
            match snap.label.as_str() {
                START_LABEL => {
                    starts.insert(snap.stage.as_str(), rss);
                }
                END_LABEL => {
                    if let Some(start) = starts.remove(snap.stage.as_str()) {
                        stage_deltas_mb.insert(snap.stage.clone(), rss - start);
                    }
                }
                _ => {}
            }
        }

        let threshold = self.warning_threshold_mb as f64;
        let threshold_breaches = snapshots
            .iter()
            .filter(|s| s.rss_mb.map_or(false, |r| r > threshold))
            .count();

        MemoryReport {
            snapshots,
            peak_mb,
            stage_deltas_mb,
            threshold_mb: self.warning_threshold_mb,
            threshold_breaches,
        }
    }

    /// Clear the history (between runs).
    pub fn reset(&self) {
        self.snapshots.lock().clear();
    }
}

/// Scoped phase tracking; see [`MemoryMonitor::track_phase`].
#[must_use = "the end snapshot is taken when the guard is dropped"]
pub struct PhaseGuard<'a> {
    monitor: &'a MemoryMonitor,
    stage: String,
    start_rss_mb: Option<f64>,
    finished: bool,
}

impl PhaseGuard<'_> {
    /// Take the end snapshot now and return the phase delta.
    pub fn finish(mut self) -> Option<f64> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Option<f64> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let end = self.monitor.snapshot(&self.stage, END_LABEL);
        match (end.rss_mb, self.start_rss_mb) {
            (Some(end), Some(start)) => Some(end - start),
            _ => None,
        }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.finish_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StaticProbe;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn monitor() -> (Arc<StaticProbe>, MemoryMonitor) {
        let probe = Arc::new(StaticProbe::new(4, 8192, None));
        probe.set_rss_mb(Some(100));
        let monitor = MemoryMonitor::with_threshold(probe.clone(), 500);
        (probe, monitor)
    }

    #[test]
    fn test_snapshot_deltas_and_peak() {
        let (probe, monitor) = monitor();
        monitor.snapshot("parsing", START_LABEL);
        probe.set_rss_mb(Some(180));
        let snap = monitor.snapshot("parsing", END_LABEL);
        assert_eq!(snap.delta_mb, Some(80.0));

        probe.set_rss_mb(Some(150));
        monitor.snapshot("quality", START_LABEL);

        let report = monitor.get_report();
        assert_eq!(report.snapshots.len(), 3);
        assert_eq!(report.peak_mb, Some(180.0));
        assert_eq!(report.stage_deltas_mb.get("parsing"), Some(&80.0));
        assert!(!report.stage_deltas_mb.contains_key("quality"));
    }

    #[test]
    fn test_unavailable_reading_is_sentinel() {
        let (probe, monitor) = monitor();
        probe.set_rss_mb(None);
        let snap = monitor.snapshot("parsing", START_LABEL);
        assert_eq!(snap.rss_mb, None);
        assert_eq!(snap.delta_mb, None);
        assert_eq!(monitor.get_report().peak_mb, None);
    }

    #[test]
    fn test_threshold_breaches_counted() {
        let (probe, monitor) = monitor();
        probe.set_rss_mb(Some(900));
        monitor.snapshot("deep_extraction", START_LABEL);
        monitor.snapshot("deep_extraction", END_LABEL);
        assert_eq!(monitor.get_report().threshold_breaches, 2);
    }

    #[test]
    fn test_track_phase_finish_returns_delta() {
        let (probe, monitor) = monitor();
        let guard = monitor.track_phase("resolution");
        probe.set_rss_mb(Some(130));
        assert_eq!(guard.finish(), Some(30.0));

        let report = monitor.get_report();
        let labels: Vec<_> = report.snapshots.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec![START_LABEL, END_LABEL]);
    }

    #[test]
    fn test_track_phase_end_snapshot_on_panic() {
        let (_probe, monitor) = monitor();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = monitor.track_phase("quality");
            panic!("checker blew up");
        }));
        assert!(result.is_err());

        let report = monitor.get_report();
        assert_eq!(report.snapshots.len(), 2);
        assert_eq!(report.snapshots[1].stage, "quality");
        assert_eq!(report.snapshots[1].label, END_LABEL);
        assert_eq!(report.stage_deltas_mb.get("quality"), Some(&0.0));
    }

    #[test]
    fn test_reset_clears_history() {
        let (_probe, monitor) = monitor();
        monitor.snapshot("parsing", START_LABEL);
        monitor.reset();
        assert_eq!(monitor.get_report(), MemoryReport {
            threshold_mb: 500,
            ..Default::default()
        });
    }
}
