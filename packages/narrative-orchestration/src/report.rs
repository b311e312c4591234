//! End-of-run report.

use crate::context::{AnalysisContext, DocumentInput};
use crate::error::{ErrorKind, PipelineError};
use crate::model::{Alert, Attribute, Chapter, Entity, Inconsistency, QualityIssue, Relationship};
use crate::stage::{SkipReason, Stage, StageStatus};
use chrono::{DateTime, Utc};
use narrative_resources::MemoryReport;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// No errors recorded.
    Success,
    /// Best-effort output plus a non-empty error list.
    PartialSuccess,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::PartialSuccess => "partial success",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub status: StageStatus,
    /// `None` when the stage was never invoked.
    pub duration_ms: Option<u64>,
    pub memory_delta_mb: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub run_id: Uuid,
    pub document_name: String,
    pub document_path: Option<PathBuf>,
    pub fingerprint: String,
    pub outcome: RunOutcome,

    pub chapters: Vec<Chapter>,
    pub entities: Vec<Entity>,
    pub attributes: Vec<Attribute>,
    pub relationships: Vec<Relationship>,
    pub quality_issues: Vec<QualityIssue>,
    pub inconsistencies: Vec<Inconsistency>,
    pub alerts: Vec<Alert>,
    pub stats: BTreeMap<String, serde_json::Value>,

    pub completed_stages: BTreeSet<Stage>,
    pub skipped_stages: BTreeMap<Stage, SkipReason>,
    pub stages: Vec<StageSummary>,

    pub errors: Vec<PipelineError>,
    pub warnings: Vec<String>,

    pub memory: MemoryReport,
    pub peak_memory_mb: Option<f64>,

    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl AnalysisReport {
    pub fn from_context(
        mut ctx: AnalysisContext,
        memory: MemoryReport,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let (errors, warnings) = ctx.take_shared();

        let stages = Stage::ALL
            .iter()
            .map(|&stage| StageSummary {
                stage,
                status: ctx.stage_status(stage),
                duration_ms: ctx
                    .phase_times()
                    .get(&stage)
                    .map(|d| d.as_millis() as u64),
                memory_delta_mb: ctx.memory_deltas().get(&stage).copied(),
            })
            .collect();

        let outcome = if errors.is_empty() {
            RunOutcome::Success
        } else {
            RunOutcome::PartialSuccess
        };

        let document_path = match &ctx.input {
            DocumentInput::Path(path) => Some(path.clone()),
            DocumentInput::Text { .. } => None,
        };
        let completed_stages = ctx.completed_stages().clone();
        let skipped_stages = ctx.skipped_stages().clone();

        Self {
            run_id: ctx.run_id,
            document_name: ctx.document_name,
            document_path,
            fingerprint: ctx.fingerprint,
            outcome,
            completed_stages,
            skipped_stages,
            stages,
            chapters: ctx.chapters,
            entities: ctx.entities,
            attributes: ctx.attributes,
            relationships: ctx.relationships,
            quality_issues: ctx.quality_issues,
            inconsistencies: ctx.inconsistencies,
            alerts: ctx.alerts,
            stats: ctx.stats,
            errors,
            warnings,
            peak_memory_mb: memory.peak_mb,
            memory,
            started_at: ctx.started_at,
            ended_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    pub fn duration_secs(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map_or(StageStatus::NotRun, |s| s.status)
    }

    pub fn error_kinds(&self) -> Vec<ErrorKind> {
        self.errors.iter().map(PipelineError::kind).collect()
    }

    /// End-of-run text summary: per-stage status and duration, peak memory,
    /// error and warning counts.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Analysis of '{}': {} ({:.2}s)",
            self.document_name,
            self.outcome.as_str(),
            self.duration_secs()
        );
        let _ = writeln!(
            out,
            "Stages: {} completed, {} skipped",
            self.completed_stages.len(),
            self.skipped_stages.len()
        );

        for summary in &self.stages {
            let duration = summary
                .duration_ms
                .map_or_else(String::new, |ms| format!("{}ms", ms));
            let memory = summary
                .memory_delta_mb
                .map_or_else(String::new, |mb| format!("{:+.1}MB", mb));
            let _ = writeln!(
                out,
                "  {:<16} {:<22} {:>8} {:>10}",
                summary.stage.as_str(),
                summary.status.as_str(),
                duration,
                memory
            );
        }

        match self.peak_memory_mb {
            Some(peak) => {
                let _ = writeln!(out, "Peak memory: {:.1}MB", peak);
            }
            None => {
                let _ = writeln!(out, "Peak memory: unavailable");
            }
        }
        let _ = writeln!(
            out,
            "Entities: {}, alerts: {}, errors: {}, warnings: {}",
            self.entities.len(),
            self.alerts.len(),
            self.errors.len(),
            self.warnings.len()
        );
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
