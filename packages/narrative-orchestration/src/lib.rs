/*
 * Narrative Orchestration - manuscript analysis pipeline
 *
 * Runs one document through a fixed sequence of analysis stages inside a
 * single process, degrading gracefully when stages fail.
 *
 * Architecture:
 * - PhaseTable (Stage → handler, fatal flag)
 * - PipelineOrchestrator (preconditions, memory gate, outcome recording)
 * - AnalysisContext (per-run shared state)
 * - ParallelTaskRunner (bounded sub-tasks inside a stage)
 * - AnalysisReport (end-of-run result and summary)
 *
 * Resource detection and memory accounting live in narrative-resources.
 */

// Public modules
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod parallel;
pub mod phases;
pub mod report;
pub mod result;
pub mod stage;
pub mod stages;
pub mod telemetry;

// Re-exports
pub use config::{
    ConfigError, ConfigResult, ParallelConfig, PipelineConfig, Preset, ResourceConfig,
    StageControl, CONFIG_VERSION,
};
pub use context::{AnalysisContext, DocumentInput};
pub use error::{ErrorKind, ErrorSeverity, PhaseError, PipelineError, Result};
pub use model::{
    Alert, AlertSeverity, Attribute, Chapter, Entity, EntityId, EntityKind, Inconsistency,
    IssueCategory, QualityIssue, Relationship,
};
pub use orchestrator::{PipelineOrchestrator, ProgressCallback};
pub use parallel::{ParallelTaskRunner, SubTask, TaskBatch};
pub use phases::{FnStage, PhaseTable, StageHandler, StageServices};
pub use report::{AnalysisReport, RunOutcome, StageSummary};
pub use result::StageResult;
pub use stage::{Precondition, SkipReason, Stage, StageStatus};
pub use stages::PlainTextParser;
pub use telemetry::init_tracing;

pub use narrative_resources as resources;
