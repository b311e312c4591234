//! Benchmark for orchestration overhead
//!
//! Measures:
//! - A full run with no-op stages (gating, bookkeeping, report)
//! - Parsing and chapter detection as documents grow
//! - Heavy-task semaphore acquire/release

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use narrative_orchestration::resources::{ResourceManager, StaticProbe};
use narrative_orchestration::{
    DocumentInput, EntityKind, PhaseTable, PipelineConfig, PipelineOrchestrator, PlainTextParser,
    Stage, StageResult,
};
use std::sync::Arc;

/// Generate a manuscript with `chapters` chapters
fn generate_manuscript(chapters: usize) -> String {
    let mut text = String::new();
    for i in 1..=chapters {
        text.push_str(&format!("Capítulo {}\n", i));
        for j in 0..20 {
            text.push_str(&format!(
                "Ana y Luis caminaron {} pasos hacia el faro número {}.\n",
                j, i
            ));
        }
        text.push('\n');
    }
    text
}

fn orchestrator() -> PipelineOrchestrator {
    let probe = Arc::new(StaticProbe::new(8, 16 * 1024, None).with_available_mb(12 * 1024));
    let resources = Arc::new(ResourceManager::with_probe(probe));

    let mut table = PhaseTable::new().with_handler(Stage::Parsing, Arc::new(PlainTextParser::new()));
    table = table.with_fn(Stage::BaseExtraction, |ctx, _| {
        ctx.add_entity("Ana", EntityKind::Character, 0.9);
        StageResult::success(())
    });
    for stage in &Stage::ALL[2..] {
        table = table.with_fn(*stage, |_, _| StageResult::success(()));
    }

    PipelineOrchestrator::with_resources(table, PipelineConfig::default(), resources)
        .expect("valid phase table")
}

/// Benchmark a full run with trivial stages
fn bench_noop_pipeline(c: &mut Criterion) {
    let orch = orchestrator();
    let text = generate_manuscript(1);

    c.bench_function("noop_pipeline", |b| {
        b.iter(|| {
            let report = orch
                .analyze(DocumentInput::text("bench", text.clone()))
                .expect("run failed");
            black_box(report);
        });
    });
}

/// Benchmark parsing as the manuscript grows
fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("parsing");

    for chapters in [10, 50, 200].iter() {
        let text = generate_manuscript(*chapters);
        group.bench_with_input(BenchmarkId::from_parameter(chapters), &text, |b, text| {
            b.iter(|| black_box(narrative_orchestration::stages::detect_chapters(text, "bench")));
        });
    }

    group.finish();
}

/// Benchmark heavy-task slot acquire/release
fn bench_semaphore(c: &mut Criterion) {
    let probe = Arc::new(StaticProbe::new(8, 16 * 1024, None));
    let resources = ResourceManager::with_probe(probe);
    let semaphore = resources.heavy_task_semaphore();

    c.bench_function("heavy_task_acquire_release", |b| {
        b.iter(|| {
            let permit = semaphore
                .acquire(black_box("embeddings_full"), None)
                .expect("slot available");
            drop(permit);
        });
    });
}

criterion_group!(benches, bench_noop_pipeline, bench_parsing, bench_semaphore);
criterion_main!(benches);
