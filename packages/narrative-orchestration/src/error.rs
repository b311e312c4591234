use crate::config::ConfigError;
use crate::stage::{Precondition, Stage};
use narrative_resources::ResourceError;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline error taxonomy.
///
/// Only [`PipelineError::Fatal`] aborts a run on its own. Anything else is
/// recorded on the context and the run continues, unless the stage that
/// raised it is marked fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Aborts the whole run (e.g. unreadable input).
    #[error("Fatal error in {stage}: {message}")]
    Fatal { stage: Stage, message: String },

    /// Stage-local failure; the run continues degraded.
    #[error("Recoverable error in {stage}: {message}")]
    Recoverable { stage: Stage, message: String },

    /// Required upstream data absent; the stage was not invoked.
    #[error("Phase '{stage}' skipped: missing required data ({missing})")]
    Precondition { stage: Stage, missing: Precondition },

    /// A bounded resource (memory, heavy-task slot) was not available.
    #[error("Resource exhaustion in {stage}: {message}")]
    ResourceExhaustion { stage: Stage, message: String },

    /// One sub-task of a stage failed; siblings were unaffected.
    #[error("Sub-task '{task}' of {stage} failed: {message}")]
    ParallelTask {
        stage: Stage,
        task: String,
        message: String,
    },

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(String),
}

impl PipelineError {
    pub fn fatal<E: fmt::Display>(stage: Stage, e: E) -> Self {
        Self::Fatal {
            stage,
            message: e.to_string(),
        }
    }

    pub fn recoverable<E: fmt::Display>(stage: Stage, e: E) -> Self {
        Self::Recoverable {
            stage,
            message: e.to_string(),
        }
    }

    pub fn resource<E: fmt::Display>(stage: Stage, e: E) -> Self {
        Self::ResourceExhaustion {
            stage,
            message: e.to_string(),
        }
    }

    pub fn parallel_task<E: fmt::Display>(stage: Stage, task: impl Into<String>, e: E) -> Self {
        Self::ParallelTask {
            stage,
            task: task.into(),
            message: e.to_string(),
        }
    }

    pub fn io<E: fmt::Display>(e: E) -> Self {
        Self::Io(e.to_string())
    }

    /// Convert a heavy-task acquisition failure raised inside `stage`.
    pub fn from_resource(stage: Stage, e: ResourceError) -> Self {
        match e {
            ResourceError::Timeout { .. } => Self::resource(stage, e),
            other => Self::recoverable(stage, other),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fatal { .. } => ErrorKind::Fatal,
            Self::Recoverable { .. } => ErrorKind::Recoverable,
            Self::Precondition { .. } => ErrorKind::Precondition,
            Self::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            Self::ParallelTask { .. } => ErrorKind::ParallelTask,
            Self::Phase(_) => ErrorKind::Phase,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.kind().severity()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Fatal
    }

    /// Stage the error is attributed to, when known.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Fatal { stage, .. }
            | Self::Recoverable { stage, .. }
            | Self::Precondition { stage, .. }
            | Self::ResourceExhaustion { stage, .. }
            | Self::ParallelTask { stage, .. } => Some(*stage),
            Self::Phase(phase) => Some(phase.stage),
            Self::Config(_) | Self::Io(_) => None,
        }
    }
}

// Serialized as a flat `{kind, severity, stage, message}` record
impl Serialize for PipelineError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ErrorRecord::from(self).serialize(serializer)
    }
}

/// Discriminant of [`PipelineError`], used for comparisons and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fatal,
    Recoverable,
    Precondition,
    ResourceExhaustion,
    ParallelTask,
    Phase,
    Config,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Fatal => "fatal",
            ErrorKind::Recoverable => "recoverable",
            ErrorKind::Precondition => "precondition",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::ParallelTask => "parallel_task",
            ErrorKind::Phase => "phase",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ErrorKind::Fatal => ErrorSeverity::Fatal,
            ErrorKind::Precondition
            | ErrorKind::ResourceExhaustion
            | ErrorKind::Phase
            | ErrorKind::Config
            | ErrorKind::Io => ErrorSeverity::Degraded,
            ErrorKind::Recoverable | ErrorKind::ParallelTask => ErrorSeverity::Recoverable,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How badly an error affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Handled locally, results unaffected.
    Recoverable,
    /// Run continues with some results missing.
    Degraded,
    /// Run aborted.
    Fatal,
}

/// Failure of a non-fatal stage, annotated with what it had and what is
/// now missing.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Phase '{stage}' failed: {cause}")]
pub struct PhaseError {
    pub stage: Stage,
    pub input_summary: String,
    pub output_summary: String,
    pub cause_kind: ErrorKind,
    pub cause: String,
}

impl PhaseError {
    pub fn new(
        stage: Stage,
        input_summary: impl Into<String>,
        output_summary: impl Into<String>,
        cause: &PipelineError,
    ) -> Self {
        Self {
            stage,
            input_summary: input_summary.into(),
            output_summary: output_summary.into(),
            cause_kind: cause.kind(),
            cause: cause.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ErrorRecord {
    kind: ErrorKind,
    severity: ErrorSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<PhaseError>,
}

impl From<&PipelineError> for ErrorRecord {
    fn from(e: &PipelineError) -> Self {
        Self {
            kind: e.kind(),
            severity: e.severity(),
            stage: e.stage(),
            message: e.to_string(),
            phase: match e {
                PipelineError::Phase(phase) => Some(phase.clone()),
                _ => None,
            },
        }
    }
}
