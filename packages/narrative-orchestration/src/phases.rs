use crate::config::{ConfigError, PipelineConfig};
use crate::context::AnalysisContext;
use crate::parallel::ParallelTaskRunner;
use crate::result::StageResult;
use crate::stage::Stage;
use narrative_resources::{MemoryMonitor, ResourceManager};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

/// Shared services handed to every stage.
pub struct StageServices {
    pub resources: Arc<ResourceManager>,
    pub runner: ParallelTaskRunner,
    pub memory: Arc<MemoryMonitor>,
    pub config: PipelineConfig,
}

/// Stage handler trait (pluggable stages)
pub trait StageHandler: Send + Sync {
    /// Label used in the phase plan and logs
    fn name(&self) -> &str;

    /// Run the stage against the context. Failures should be returned, not
    /// panicked; the orchestrator catches panics anyway.
    fn execute(&self, ctx: &mut AnalysisContext, services: &StageServices) -> StageResult<()>;
}

/// Closure-backed handler.
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> FnStage<F>
where
    F: Fn(&mut AnalysisContext, &StageServices) -> StageResult<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> StageHandler for FnStage<F>
where
    F: Fn(&mut AnalysisContext, &StageServices) -> StageResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: &mut AnalysisContext, services: &StageServices) -> StageResult<()> {
        (self.f)(ctx, services)
    }
}

/// Explicit `Stage → handler` table, iterated in pipeline order.
///
/// Stages without a handler are reported as disabled. Parsing is fatal by
/// default: if it fails there is nothing to analyze.
#[derive(Clone)]
pub struct PhaseTable {
    handlers: BTreeMap<Stage, Arc<dyn StageHandler>>,
    fatal: BTreeSet<Stage>,
}

impl Default for PhaseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTable {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            fatal: BTreeSet::from([Stage::Parsing]),
        }
    }

    pub fn with_handler(mut self, stage: Stage, handler: Arc<dyn StageHandler>) -> Self {
        self.register(stage, handler);
        self
    }

    pub fn with_fn<F>(self, stage: Stage, f: F) -> Self
    where
        F: Fn(&mut AnalysisContext, &StageServices) -> StageResult<()> + Send + Sync + 'static,
    {
        self.with_handler(stage, Arc::new(FnStage::new(stage.as_str(), f)))
    }

    /// Mark a stage fatal (its failure aborts the run) or not.
    pub fn fatal(mut self, stage: Stage, fatal: bool) -> Self {
        if fatal {
            self.fatal.insert(stage);
        } else {
            self.fatal.remove(&stage);
        }
        self
    }

    pub fn register(&mut self, stage: Stage, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage, handler);
    }

    pub fn handler(&self, stage: Stage) -> Option<&Arc<dyn StageHandler>> {
        self.handlers.get(&stage)
    }

    pub fn is_fatal(&self, stage: Stage) -> bool {
        self.fatal.contains(&stage)
    }

    /// `(stage, handler, fatal)` in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (Stage, Option<&Arc<dyn StageHandler>>, bool)> + '_ {
        Stage::ALL
            .into_iter()
            .map(move |stage| (stage, self.handlers.get(&stage), self.is_fatal(stage)))
    }

    /// A table must at least know how to parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handlers.contains_key(&Stage::Parsing) {
            Ok(())
        } else {
            Err(ConfigError::MissingHandler(Stage::Parsing))
        }
    }

    /// Human-readable execution plan.
    pub fn describe(&self, config: &PipelineConfig) -> String {
        let mut plan = String::from("Phase plan:\n");
        for (idx, (stage, handler, fatal)) in self.iter().enumerate() {
            let handler_name = handler.map_or("-", |h| h.name());
            let note = if handler.is_none() {
                " (no handler)"
            } else if !config.stages.is_enabled(stage) {
                " (disabled)"
            } else if fatal {
                " [fatal]"
            } else {
                ""
            };
            let _ = writeln!(plan, "  {}. {:<16} {}{}", idx + 1, stage.as_str(), handler_name, note);
        }
        plan
    }
}
