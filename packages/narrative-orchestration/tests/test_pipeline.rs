//! Integration tests for the analysis pipeline
//!
//! Drives the orchestrator end to end with small in-process stages:
//! - Precondition gating and disabled stages
//! - Fatal vs recoverable failures
//! - Memory danger skips and relief
//! - Progress reporting and determinism

use narrative_orchestration::resources::{ReliefIntensity, ResourceManager, StaticProbe};
use narrative_orchestration::{
    Alert, AlertSeverity, AnalysisContext, Attribute, DocumentInput, EntityKind, ErrorKind,
    IssueCategory, PhaseTable, PipelineConfig, PipelineError, PipelineOrchestrator,
    PlainTextParser, Preset, QualityIssue, RunOutcome, SkipReason, Stage, StageHandler,
    StageResult, StageStatus, SubTask,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const NOVEL: &str = "Capítulo 1\nAna llegó al faro con Luis.\n\nCapítulo 2\nMarta esperaba a Ana en el puerto.\n";
const CHARACTERS: [&str; 3] = ["Ana", "Luis", "Marta"];

type Invocations = Arc<Mutex<Vec<Stage>>>;

fn probe() -> Arc<StaticProbe> {
    Arc::new(StaticProbe::new(8, 16 * 1024, None).with_available_mb(12 * 1024))
}

fn orchestrator(table: PhaseTable, config: PipelineConfig, probe: Arc<StaticProbe>) -> PipelineOrchestrator {
    let resources = Arc::new(ResourceManager::with_probe(probe));
    PipelineOrchestrator::with_resources(table, config, resources).unwrap()
}

/// A full table of toy stages. Every handler logs its invocation.
fn novel_table(log: &Invocations, fail_grammar: bool) -> PhaseTable {
    let parser = Arc::new(PlainTextParser::new());

    let l = log.clone();
    let table = PhaseTable::new().with_fn(Stage::Parsing, move |ctx, services| {
        l.lock().push(Stage::Parsing);
        parser.execute(ctx, services)
    });

    let l = log.clone();
    let table = table.with_fn(Stage::BaseExtraction, move |ctx, _| {
        l.lock().push(Stage::BaseExtraction);
        let text = ctx.full_text.clone();
        for word in text.split(|c: char| !c.is_alphabetic()) {
            if CHARACTERS.contains(&word) {
                ctx.add_entity(word, EntityKind::Character, 0.9);
            }
        }
        StageResult::success(())
    });

    let l = log.clone();
    let table = table.with_fn(Stage::Resolution, move |_, _| {
        l.lock().push(Stage::Resolution);
        StageResult::success(())
    });

    let l = log.clone();
    let table = table.with_fn(Stage::DeepExtraction, move |ctx, services| {
        l.lock().push(Stage::DeepExtraction);
        let tasks: Vec<SubTask<'_, Attribute>> = ctx
            .entities
            .iter()
            .map(|e| {
                let (id, name) = (e.id, e.name.clone());
                SubTask::new(format!("attributes:{}", name), move |c: &AnalysisContext| {
                    Ok(Attribute {
                        entity_id: id,
                        key: "first_chapter".to_string(),
                        value: c
                            .chapters
                            .iter()
                            .find(|ch| ch.content.contains(&name))
                            .map_or_else(|| "?".to_string(), |ch| ch.number.to_string()),
                        chapter: None,
                        confidence: 0.8,
                    })
                })
            })
            .collect();
        let batch = services.runner.run(Stage::DeepExtraction, ctx, tasks);
        ctx.attributes
            .extend(batch.outputs.into_iter().map(|(_, attribute)| attribute));
        StageResult::success(())
    });

    let l = log.clone();
    let table = table.with_fn(Stage::Quality, move |ctx, services| {
        l.lock().push(Stage::Quality);
        let tasks: Vec<SubTask<'_, Vec<QualityIssue>>> = vec![
            SubTask::new("repetitions", |c: &AnalysisContext| {
                let count = c.full_text.matches("Ana").count();
                Ok((count > 1)
                    .then(|| QualityIssue {
                        category: IssueCategory::Repetition,
                        message: "'Ana' repeated".to_string(),
                        start_char: 0,
                        end_char: 0,
                        suggestion: None,
                        confidence: 0.6,
                    })
                    .into_iter()
                    .collect())
            }),
            SubTask::new("grammar", move |_: &AnalysisContext| {
                if fail_grammar {
                    anyhow::bail!("grammar model unavailable")
                }
                Ok(Vec::new())
            }),
        ];
        let batch = services.runner.run(Stage::Quality, ctx, tasks);
        let failures = batch.failures.clone();
        ctx.quality_issues
            .extend(batch.outputs.into_iter().flat_map(|(_, issues)| issues));
        StageResult::partial((), failures)
    });

    let l = log.clone();
    let table = table.with_fn(Stage::Consistency, move |_, _| {
        l.lock().push(Stage::Consistency);
        StageResult::success(())
    });

    let l = log.clone();
    table.with_fn(Stage::Alerts, move |ctx, _| {
        l.lock().push(Stage::Alerts);
        let issues = ctx.quality_issues.len();
        if issues > 0 {
            ctx.alerts.push(Alert::new(
                AlertSeverity::Low,
                "quality",
                format!("{} quality issues", issues),
                Stage::Quality,
            ));
        }
        StageResult::success(())
    })
}

fn invoked(log: &Invocations) -> Vec<Stage> {
    log.lock().clone()
}

// ═══════════════════════════════════════════════════════════
// Full runs
// ═══════════════════════════════════════════════════════════

#[test]
fn test_full_run_completes_every_stage() {
    let log = Invocations::default();
    let orch = orchestrator(novel_table(&log, false), PipelineConfig::default(), probe());

    let report = orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(invoked(&log), Stage::ALL.to_vec());
    assert_eq!(report.completed_stages.len(), 7);
    assert!(report.skipped_stages.is_empty());
    assert_eq!(report.chapters.len(), 2);
    assert_eq!(report.entities.len(), 3);
    assert_eq!(report.attributes.len(), 3);
    assert_eq!(report.quality_issues.len(), 1);
    assert_eq!(report.alerts.len(), 1);
    assert!(report
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Completed && s.duration_ms.is_some()));
}

#[test]
fn test_sub_task_failure_yields_partial_success() {
    let log = Invocations::default();
    let orch = orchestrator(novel_table(&log, true), PipelineConfig::default(), probe());

    let report = orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();

    assert_eq!(report.outcome, RunOutcome::PartialSuccess);
    assert_eq!(report.stage_status(Stage::Quality), StageStatus::Completed);
    assert_eq!(report.error_kinds(), vec![ErrorKind::ParallelTask]);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("'grammar'"));
    // The sibling sub-task still produced its finding
    assert_eq!(report.quality_issues.len(), 1);
}

#[test]
fn test_zero_entities_skips_entity_stages() {
    let log = Invocations::default();
    let orch = orchestrator(novel_table(&log, false), PipelineConfig::default(), probe());

    let report = orch
        .analyze(DocumentInput::text("paisaje", "El mar estaba en calma.\n"))
        .unwrap();

    for stage in [Stage::Resolution, Stage::DeepExtraction, Stage::Consistency] {
        assert_eq!(
            report.stage_status(stage),
            StageStatus::Skipped(SkipReason::Precondition)
        );
        assert!(!invoked(&log).contains(&stage));
    }
    assert_eq!(report.stage_status(Stage::Quality), StageStatus::Completed);
    assert_eq!(report.stage_status(Stage::Alerts), StageStatus::Completed);
    assert_eq!(
        report.error_kinds(),
        vec![ErrorKind::Precondition; 3]
    );
    assert_eq!(report.outcome, RunOutcome::PartialSuccess);
}

#[test]
fn test_empty_document() {
    let log = Invocations::default();
    let orch = orchestrator(novel_table(&log, false), PipelineConfig::default(), probe());

    let report = orch.analyze(DocumentInput::text("vacío", "")).unwrap();

    assert_eq!(invoked(&log), vec![Stage::Parsing, Stage::Alerts]);
    assert_eq!(report.stage_status(Stage::Parsing), StageStatus::Completed);
    for stage in [
        Stage::BaseExtraction,
        Stage::Resolution,
        Stage::DeepExtraction,
        Stage::Quality,
        Stage::Consistency,
    ] {
        assert_eq!(
            report.stage_status(stage),
            StageStatus::Skipped(SkipReason::Precondition),
            "{}",
            stage
        );
    }
    assert_eq!(report.stage_status(Stage::Alerts), StageStatus::Completed);
    assert!(report.entities.is_empty());
    assert!(report.alerts.is_empty());
    assert_eq!(report.errors.len(), 5);
}

// ═══════════════════════════════════════════════════════════
// Failures
// ═══════════════════════════════════════════════════════════

#[test]
fn test_unreadable_document_aborts_run() {
    let log = Invocations::default();
    let orch = orchestrator(novel_table(&log, false), PipelineConfig::default(), probe());

    let err = orch
        .analyze(DocumentInput::path("/nonexistent/manuscrito.txt"))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(err.stage(), Some(Stage::Parsing));
    assert_eq!(invoked(&log), vec![Stage::Parsing]);
}

#[test]
fn test_recoverable_failure_continues() {
    let log = Invocations::default();
    let table = novel_table(&log, false).with_fn(Stage::Resolution, |_, _| {
        StageResult::failure(PipelineError::recoverable(
            Stage::Resolution,
            "coreference model not loaded",
        ))
    });
    let orch = orchestrator(table, PipelineConfig::default(), probe());

    let report = orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();

    assert_eq!(
        report.stage_status(Stage::Resolution),
        StageStatus::Skipped(SkipReason::Failed)
    );
    assert_eq!(report.stage_status(Stage::DeepExtraction), StageStatus::Completed);
    assert_eq!(report.stage_status(Stage::Alerts), StageStatus::Completed);
    assert_eq!(report.outcome, RunOutcome::PartialSuccess);

    match &report.errors[..] {
        [PipelineError::Phase(phase)] => {
            assert_eq!(phase.stage, Stage::Resolution);
            assert_eq!(phase.cause_kind, ErrorKind::Recoverable);
            assert!(phase.cause.contains("coreference model not loaded"));
        }
        other => panic!("unexpected errors: {:?}", other),
    }
}

#[test]
fn test_stage_marked_fatal_aborts_run() {
    let log = Invocations::default();
    let table = novel_table(&log, false)
        .with_fn(Stage::DeepExtraction, |_, _| panic!("attribute extractor crashed"))
        .fatal(Stage::DeepExtraction, true);
    let orch = orchestrator(table, PipelineConfig::default(), probe());

    let err = orch
        .analyze(DocumentInput::text("el_faro", NOVEL))
        .unwrap_err();

    assert!(err.is_fatal());
    assert!(err.to_string().contains("attribute extractor crashed"));
    assert!(!invoked(&log).contains(&Stage::Quality));
}

#[test]
fn test_fatal_error_from_non_fatal_stage_aborts_run() {
    let log = Invocations::default();
    let table = novel_table(&log, false).with_fn(Stage::Quality, |_, _| {
        StageResult::failure(PipelineError::fatal(Stage::Quality, "corrupted dictionary"))
    });
    let orch = orchestrator(table, PipelineConfig::default(), probe());

    let err = orch
        .analyze(DocumentInput::text("el_faro", NOVEL))
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Quality));
    assert!(!invoked(&log).contains(&Stage::Consistency));
}

#[test]
fn test_io_failure_in_quality_continues() {
    let log = Invocations::default();
    let table = novel_table(&log, false).with_fn(Stage::Quality, |_, _| {
        StageResult::failure(PipelineError::io("dictionary file missing"))
    });
    let orch = orchestrator(table, PipelineConfig::default(), probe());
    assert!(!orch.table().is_fatal(Stage::Quality));

    let report = orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();

    assert_eq!(
        report.stage_status(Stage::Quality),
        StageStatus::Skipped(SkipReason::Failed)
    );
    assert_eq!(report.stage_status(Stage::Consistency), StageStatus::Completed);
    assert_eq!(report.stage_status(Stage::Alerts), StageStatus::Completed);
    assert_eq!(report.outcome, RunOutcome::PartialSuccess);

    match &report.errors[..] {
        [PipelineError::Phase(phase)] => {
            assert_eq!(phase.cause_kind, ErrorKind::Io);
            assert_eq!(phase.output_summary, "missing quality issues");
        }
        other => panic!("unexpected errors: {:?}", other),
    }
}

// ═══════════════════════════════════════════════════════════
// Resources
// ═══════════════════════════════════════════════════════════

#[test]
fn test_memory_danger_skips_non_fatal_stages() {
    let log = Invocations::default();
    let probe = probe();
    probe.set_ram_percent_used(97.0);

    let resources = Arc::new(ResourceManager::with_probe(probe.clone()));
    let relief_runs = Arc::new(AtomicUsize::new(0));
    let counter = relief_runs.clone();
    resources.register_relief_hook("drop_models", ReliefIntensity::Aggressive, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        0
    });

    let orch = PipelineOrchestrator::with_resources(
        novel_table(&log, false),
        PipelineConfig::default(),
        resources,
    )
    .unwrap();

    let report = orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();

    // Parsing is fatal and runs anyway; everything gated on memory is skipped
    assert_eq!(report.stage_status(Stage::Parsing), StageStatus::Completed);
    assert_eq!(
        report.stage_status(Stage::BaseExtraction),
        StageStatus::Skipped(SkipReason::Resource)
    );
    assert_eq!(
        report.stage_status(Stage::Resolution),
        StageStatus::Skipped(SkipReason::Precondition)
    );
    assert_eq!(
        report.stage_status(Stage::Quality),
        StageStatus::Skipped(SkipReason::Resource)
    );
    assert_eq!(
        report.stage_status(Stage::Alerts),
        StageStatus::Skipped(SkipReason::Resource)
    );
    assert_eq!(invoked(&log), vec![Stage::Parsing]);

    // One relief pass per gated stage: parsing, base extraction, quality, alerts
    assert_eq!(relief_runs.load(Ordering::SeqCst), 4);
    assert!(report
        .error_kinds()
        .contains(&ErrorKind::ResourceExhaustion));
}

#[test]
fn test_successful_relief_lets_stage_run() {
    let log = Invocations::default();
    let probe = probe();
    probe.set_ram_percent_used(97.0);

    let resources = Arc::new(ResourceManager::with_probe(probe.clone()));
    let relieved = probe.clone();
    resources.register_relief_hook("clear_caches", ReliefIntensity::Normal, move || {
        relieved.set_ram_percent_used(60.0);
        512 * 1024 * 1024
    });

    let orch = PipelineOrchestrator::with_resources(
        novel_table(&log, false),
        PipelineConfig::default(),
        resources,
    )
    .unwrap();

    let report = orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(invoked(&log), Stage::ALL.to_vec());
}

#[test]
fn test_memory_gate_can_be_disabled() {
    let log = Invocations::default();
    let probe = probe();
    probe.set_ram_percent_used(99.0);

    let config = PipelineConfig::default().with_resources(|mut r| {
        r.skip_on_memory_danger = false;
        r
    });
    let orch = orchestrator(novel_table(&log, false), config, probe);

    let report = orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();
    assert_eq!(report.completed_stages.len(), 7);
}

// ═══════════════════════════════════════════════════════════
// Configuration, progress, determinism
// ═══════════════════════════════════════════════════════════

#[test]
fn test_express_preset_disables_entity_stages() {
    let log = Invocations::default();
    let orch = orchestrator(
        novel_table(&log, false),
        PipelineConfig::preset(Preset::Express),
        probe(),
    );

    let report = orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();

    assert_eq!(
        invoked(&log),
        vec![Stage::Parsing, Stage::Quality, Stage::Alerts]
    );
    for stage in [
        Stage::BaseExtraction,
        Stage::Resolution,
        Stage::DeepExtraction,
        Stage::Consistency,
    ] {
        assert_eq!(
            report.stage_status(stage),
            StageStatus::Skipped(SkipReason::Disabled)
        );
    }
    // Disabled stages are not errors
    assert!(report.is_success());
}

#[test]
fn test_yaml_config_drives_stages() {
    let yaml = r#"
version: 1
preset: standard
stages:
  deep_extraction: false
parallel:
  enabled: false
  max_workers: 2
"#;
    let config = PipelineConfig::from_yaml_str(yaml).unwrap();
    let log = Invocations::default();
    let orch = orchestrator(novel_table(&log, false), config, probe());

    let report = orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();

    // Consistency depends on deep extraction and is switched off with it
    assert_eq!(
        report.stage_status(Stage::DeepExtraction),
        StageStatus::Skipped(SkipReason::Disabled)
    );
    assert_eq!(
        report.stage_status(Stage::Consistency),
        StageStatus::Skipped(SkipReason::Disabled)
    );
    assert_eq!(report.stage_status(Stage::Resolution), StageStatus::Completed);
}

#[test]
fn test_min_confidence_filters_findings_before_alerts() {
    let log = Invocations::default();
    let mut config = PipelineConfig::default();
    config.min_confidence = 0.7;
    let orch = orchestrator(novel_table(&log, false), config, probe());

    let report = orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();

    // The 0.6 repetition finding never reaches the alerts stage
    assert!(report.quality_issues.is_empty());
    assert!(report.alerts.is_empty());
    assert_eq!(report.stage_status(Stage::Quality), StageStatus::Completed);
}

#[test]
fn test_progress_milestones() {
    let log = Invocations::default();
    let seen: Arc<Mutex<Vec<(f64, String)>>> = Arc::default();
    let sink = seen.clone();
    let orch = orchestrator(novel_table(&log, false), PipelineConfig::default(), probe())
        .with_progress(move |fraction, message| sink.lock().push((fraction, message.to_string())));

    orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();

    let seen = seen.lock();
    let fractions: Vec<f64> = seen.iter().map(|(f, _)| *f).collect();
    assert_eq!(fractions, vec![0.0, 0.15, 0.35, 0.50, 0.70, 0.85, 0.95, 1.0]);
    assert_eq!(seen[0].1, "Parsing document...");
}

#[test]
fn test_repeated_runs_are_deterministic() {
    let run = || {
        let log = Invocations::default();
        let orch = orchestrator(novel_table(&log, true), PipelineConfig::default(), probe());
        orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap()
    };

    let first = run();
    let second = run();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(first.completed_stages, second.completed_stages);
    assert_eq!(first.skipped_stages, second.skipped_stages);
    assert_eq!(first.entities, second.entities);
    assert_eq!(first.attributes, second.attributes);
    assert_eq!(first.error_kinds(), second.error_kinds());
    assert_eq!(first.warnings, second.warnings);
}

#[test]
fn test_report_serializes() {
    let log = Invocations::default();
    let orch = orchestrator(novel_table(&log, false), PipelineConfig::default(), probe());
    let report = orch.analyze(DocumentInput::text("el_faro", NOVEL)).unwrap();

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["document_name"], "el_faro");
    assert_eq!(json["stages"].as_array().unwrap().len(), 7);
    assert!(report.summary().contains("7 completed, 0 skipped"));
}
