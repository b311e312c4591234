//! Pipeline orchestrator.
//!
//! Drives the phase table in fixed order against one `AnalysisContext`.
//! Every stage goes through `run_stage`, which applies the configuration
//! switch, the stage preconditions and the memory gate before invoking the
//! handler, and records the outcome afterwards. Only a fatal failure stops
//! the run; anything else is recorded and the pipeline moves on.

use crate::config::PipelineConfig;
use crate::context::{AnalysisContext, DocumentInput};
use crate::error::{PhaseError, PipelineError, Result};
use crate::parallel::{panic_message, ParallelTaskRunner};
use crate::phases::{PhaseTable, StageHandler, StageServices};
use crate::report::AnalysisReport;
use crate::result::StageResult;
use crate::stage::{SkipReason, Stage, StageStatus};
use narrative_resources::{MemoryMonitor, MemoryPressure, ResourceManager};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Called with `(fraction, message)` before each stage and once at the end.
pub type ProgressCallback = Box<dyn Fn(f64, &str) + Send + Sync>;

pub struct PipelineOrchestrator {
    table: PhaseTable,
    services: StageServices,
    progress: Option<ProgressCallback>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator backed by the process-wide resource manager.
    pub fn new(table: PhaseTable, config: PipelineConfig) -> Result<Self> {
        Self::with_resources(table, config, ResourceManager::shared())
    }

    /// Create with an explicit resource manager (tests inject a `StaticProbe`
    /// through this).
    pub fn with_resources(
        table: PhaseTable,
        mut config: PipelineConfig,
        resources: Arc<ResourceManager>,
    ) -> Result<Self> {
        table.validate()?;
        let adjustments = config.validate()?;
        if !adjustments.is_empty() {
            info!("Configuration adjusted: {}", adjustments.join("; "));
        }

        let memory = Arc::new(MemoryMonitor::with_threshold(
            resources.probe(),
            config.resources.memory_warning_threshold_mb,
        ));
        let runner = ParallelTaskRunner::new(resources.clone(), &config);

        Ok(Self {
            table,
            services: StageServices {
                resources,
                runner,
                memory,
                config,
            },
            progress: None,
        })
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(f64, &str) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.services.config
    }

    pub fn services(&self) -> &StageServices {
        &self.services
    }

    pub fn table(&self) -> &PhaseTable {
        &self.table
    }

    /// Analyze one document (main entry point)
    pub fn analyze(&self, input: DocumentInput) -> Result<AnalysisReport> {
        self.run(AnalysisContext::new(input))
    }

    /// Run every stage against `ctx` and build the report.
    ///
    /// Returns `Err` only when a fatal stage fails; the partially filled
    /// context is dropped in that case.
    pub fn run(&self, mut ctx: AnalysisContext) -> Result<AnalysisReport> {
        let start_time = Instant::now();
        self.services.memory.reset();

        info!(
            "Starting analysis {} of '{}' (preset: {})",
            ctx.run_id,
            ctx.document_name,
            self.services.config.preset.as_str()
        );
        info!("{}", self.table.describe(&self.services.config));

        for (stage, handler, fatal) in self.table.iter() {
            self.report_progress(stage.progress_milestone(), stage.progress_message());
            if let Err(e) = self.run_stage(stage, handler, &mut ctx, fatal) {
                error!(
                    "Analysis {} aborted at stage {} after {:.2}s: {}",
                    ctx.run_id,
                    stage,
                    start_time.elapsed().as_secs_f64(),
                    e
                );
                return Err(e);
            }

            // Later stages only see findings above the confidence floor
            let min_confidence = self.services.config.min_confidence;
            let dropped = ctx.retain_confident_findings(min_confidence);
            if dropped > 0 {
                debug!(
                    "Dropped {} findings from {} below confidence {}",
                    dropped, stage, min_confidence
                );
            }
        }

        self.report_progress(1.0, "Analysis complete");

        let report = ctx.into_report(self.services.memory.get_report());
        info!(
            "Analysis {} finished ({}): {} stages completed, {} skipped, {} errors in {:.2}s",
            report.run_id,
            report.outcome.as_str(),
            report.completed_stages.len(),
            report.skipped_stages.len(),
            report.errors.len(),
            start_time.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    /// Run a single stage and record its outcome on `ctx`.
    ///
    /// `Err` means the run must stop: the stage failed and either the stage
    /// is marked fatal or the error itself is fatal.
    pub fn run_stage(
        &self,
        stage: Stage,
        handler: Option<&Arc<dyn StageHandler>>,
        ctx: &mut AnalysisContext,
        is_fatal: bool,
    ) -> Result<StageStatus> {
        let handler = match handler {
            Some(handler) if self.services.config.stages.is_enabled(stage) => handler,
            _ => {
                debug!("Stage {} disabled", stage);
                ctx.mark_skipped(stage, SkipReason::Disabled);
                return Ok(ctx.stage_status(stage));
            }
        };

        if let Some(missing) = ctx.unmet_precondition(stage) {
            let err = PipelineError::Precondition { stage, missing };
            warn!("{}", err);
            ctx.push_error(err);
            ctx.mark_skipped(stage, SkipReason::Precondition);
            return Ok(ctx.stage_status(stage));
        }

        if let Some(err) = self.check_memory(stage, is_fatal) {
            warn!("Stage {} skipped: {}", stage, err);
            ctx.push_error(err);
            ctx.mark_skipped(stage, SkipReason::Resource);
            return Ok(ctx.stage_status(stage));
        }

        info!("Executing stage: {} ({})", stage, handler.name());
        let input_summary = ctx.input_summary();
        let started = Instant::now();
        let guard = self.services.memory.track_phase(stage.as_str());

        let outcome = catch_unwind(AssertUnwindSafe(|| handler.execute(ctx, &self.services)));

        let memory_delta = guard.finish();
        let elapsed = started.elapsed();
        ctx.record_phase(stage, elapsed, memory_delta);

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => StageResult::failure(PipelineError::recoverable(
                stage,
                format!("panicked: {}", panic_message(&*payload)),
            )),
        };

        match result {
            StageResult::Success(()) => {
                info!("Stage {} completed in {}ms", stage, elapsed.as_millis());
                ctx.mark_completed(stage);
            }
            StageResult::Partial((), errors) => {
                warn!(
                    "Stage {} completed with {} errors in {}ms",
                    stage,
                    errors.len(),
                    elapsed.as_millis()
                );
                ctx.extend_errors(errors);
                ctx.mark_completed(stage);
            }
            StageResult::Failure(err) => {
                if is_fatal || err.is_fatal() {
                    error!("Stage {} failed: {}", stage, err);
                    return Err(if err.is_fatal() {
                        err
                    } else {
                        PipelineError::fatal(stage, &err)
                    });
                }

                warn!("Stage {} failed, continuing: {}", stage, err);
                let output_summary = format!("missing {}", stage.outputs());
                let phase = PhaseError::new(stage, input_summary, output_summary, &err);
                ctx.push_error(PipelineError::Phase(phase));
                ctx.mark_skipped(stage, SkipReason::Failed);
            }
        }

        Ok(ctx.stage_status(stage))
    }

    /// `Some(error)` when the stage must be skipped for lack of memory.
    ///
    /// At danger level one aggressive relief pass is attempted. Fatal stages
    /// run regardless.
    fn check_memory(&self, stage: Stage, is_fatal: bool) -> Option<PipelineError> {
        if !self.services.config.resources.skip_on_memory_danger {
            return None;
        }

        let resources = &self.services.resources;
        if resources.check_memory_pressure() != MemoryPressure::Danger {
            return None;
        }

        warn!("Memory pressure at danger level before stage {}, attempting relief", stage);
        let relief = resources.relieve_memory_pressure(true);
        if relief.pressure_after != MemoryPressure::Danger {
            info!(
                "Memory relief before stage {} succeeded ({} -> {})",
                stage, relief.pressure_before, relief.pressure_after
            );
            return None;
        }

        if is_fatal {
            warn!("Stage {} is fatal, running despite memory danger", stage);
            return None;
        }

        Some(PipelineError::resource(
            stage,
            format!(
                "memory pressure still {} after relief ({} hooks run)",
                relief.pressure_after,
                relief.hooks_run.len()
            ),
        ))
    }

    fn report_progress(&self, fraction: f64, message: &str) {
        if let Some(callback) = &self.progress {
            callback(fraction, message);
        }
    }
}
