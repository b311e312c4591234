//! Bounded sub-task execution inside one stage.
//!
//! Sub-tasks are independent closures over `&AnalysisContext`. Each batch
//! gets its own rayon pool sized by the resource manager's current advice,
//! so pressure measured at batch start shrinks the pool. A failing or
//! panicking sub-task becomes a named warning on the context and never
//! affects its siblings.

use crate::config::PipelineConfig;
use crate::context::AnalysisContext;
use crate::error::PipelineError;
use crate::result::StageResult;
use crate::stage::Stage;
use narrative_resources::ResourceManager;
use rayon::prelude::*;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type TaskFn<'a, T> = Box<dyn FnOnce(&AnalysisContext) -> anyhow::Result<T> + Send + 'a>;

/// One named unit of work.
pub struct SubTask<'a, T> {
    name: String,
    heavy_task: Option<&'static str>,
    run: TaskFn<'a, T>,
}

impl<'a, T> SubTask<'a, T> {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(&AnalysisContext) -> anyhow::Result<T> + Send + 'a,
    {
        Self {
            name: name.into(),
            heavy_task: None,
            run: Box::new(f),
        }
    }

    /// Throttle this task through the heavy-task semaphore under `kind`
    /// (one of `narrative_resources::HEAVY_TASKS`).
    pub fn heavy(mut self, kind: &'static str) -> Self {
        self.heavy_task = Some(kind);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outputs of one batch, in submission order.
#[derive(Debug)]
pub struct TaskBatch<T> {
    pub outputs: Vec<(String, T)>,
    pub failures: Vec<PipelineError>,
    pub workers: usize,
    pub parallel: bool,
    pub elapsed: Duration,
}

impl<T> TaskBatch<T> {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn output(&self, name: &str) -> Option<&T> {
        self.outputs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// `Partial` when any sub-task failed, otherwise `Success`.
    pub fn into_stage_result(self) -> StageResult<Vec<(String, T)>> {
        StageResult::partial(self.outputs, self.failures)
    }
}

pub struct ParallelTaskRunner {
    resources: Arc<ResourceManager>,
    enabled: bool,
    max_workers: usize,
    heavy_task_timeout: Option<Duration>,
}

impl ParallelTaskRunner {
    pub fn new(resources: Arc<ResourceManager>, config: &PipelineConfig) -> Self {
        Self {
            resources,
            enabled: config.parallel.enabled,
            max_workers: config.parallel.max_workers.max(1),
            heavy_task_timeout: config.resources.heavy_task_timeout(),
        }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Pool size for `task_count` tasks under current conditions.
    pub fn worker_count(&self, task_count: usize) -> usize {
        self.resources
            .get_available_workers()
            .min(self.max_workers)
            .min(task_count)
            .min(num_cpus::get())
            .max(1)
    }

    pub fn run<'a, T: Send>(
        &self,
        stage: Stage,
        ctx: &AnalysisContext,
        tasks: Vec<SubTask<'a, T>>,
    ) -> TaskBatch<T> {
        let start = Instant::now();
        let task_count = tasks.len();

        let (results, workers, parallel) = if !self.enabled || task_count <= 1 {
            (self.run_sequential(stage, ctx, tasks), 1, false)
        } else {
            let workers = self.worker_count(task_count);
            match rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("narrative-worker-{}", i))
                .build()
            {
                Ok(pool) => {
                    debug!("{}: {} sub-tasks on {} workers", stage, task_count, workers);
                    let results = pool.install(|| {
                        tasks
                            .into_par_iter()
                            .map(|task| self.execute(stage, ctx, task))
                            .collect::<Vec<_>>()
                    });
                    (results, workers, true)
                }
                Err(e) => {
                    warn!("{}: worker pool unavailable ({}), running sequentially", stage, e);
                    (self.run_sequential(stage, ctx, tasks), 1, false)
                }
            }
        };

        let mut outputs = Vec::with_capacity(task_count);
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(value) => outputs.push((name, value)),
                Err(e) => {
                    warn!("{}", e);
                    ctx.push_warning(e.to_string());
                    failures.push(e);
                }
            }
        }

        TaskBatch {
            outputs,
            failures,
            workers,
            parallel,
            elapsed: start.elapsed(),
        }
    }

    fn run_sequential<T>(
        &self,
        stage: Stage,
        ctx: &AnalysisContext,
        tasks: Vec<SubTask<'_, T>>,
    ) -> Vec<(String, Result<T, PipelineError>)> {
        tasks
            .into_iter()
            .map(|task| self.execute(stage, ctx, task))
            .collect()
    }

    fn execute<T>(
        &self,
        stage: Stage,
        ctx: &AnalysisContext,
        task: SubTask<'_, T>,
    ) -> (String, Result<T, PipelineError>) {
        let SubTask {
            name,
            heavy_task,
            run,
        } = task;

        let outcome = catch_unwind(AssertUnwindSafe(|| match heavy_task {
            Some(kind) => self
                .resources
                .run_heavy_task(kind, || run(ctx), self.heavy_task_timeout)
                .map_err(|e| PipelineError::from_resource(stage, e))
                .and_then(|r| r.map_err(|e| PipelineError::parallel_task(stage, &name, format!("{:#}", e)))),
            None => run(ctx).map_err(|e| PipelineError::parallel_task(stage, &name, format!("{:#}", e))),
        }));

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(PipelineError::parallel_task(
                stage,
                &name,
                format!("panicked: {}", panic_message(&*payload)),
            )),
        };
        (name, result)
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
