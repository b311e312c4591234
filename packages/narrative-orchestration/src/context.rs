//! Per-run analysis context.
//!
//! One `AnalysisContext` is created per run and passed `&mut` from stage to
//! stage. Each stage writes the collections it owns. Sub-tasks running in
//! parallel inside a stage only get `&AnalysisContext`, so the pieces they
//! may share (entity-name index, error and warning lists) sit behind
//! `parking_lot` mutexes and are copied out on read.

use crate::error::PipelineError;
use crate::model::{
    Alert, Attribute, Chapter, Entity, EntityId, EntityKind, Inconsistency, QualityIssue,
    Relationship,
};
use crate::report::AnalysisReport;
use crate::stage::{Precondition, SkipReason, Stage, StageStatus};
use chrono::{DateTime, Utc};
use narrative_resources::MemoryReport;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// What to analyze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentInput {
    /// Read by the parsing stage.
    Path(PathBuf),
    /// Already in memory; parsing only normalizes it.
    Text { name: String, text: String },
}

impl DocumentInput {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Text {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Path(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Self::Text { name, .. } => name.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct EntityIndex {
    ids: BTreeMap<String, EntityId>,
    next_id: EntityId,
}

pub struct AnalysisContext {
    pub run_id: Uuid,
    pub input: DocumentInput,
    pub document_name: String,
    pub full_text: String,
    /// SHA-256 of the normalized text.
    pub fingerprint: String,

    pub chapters: Vec<Chapter>,
    pub entities: Vec<Entity>,
    pub attributes: Vec<Attribute>,
    pub relationships: Vec<Relationship>,
    pub quality_issues: Vec<QualityIssue>,
    pub inconsistencies: Vec<Inconsistency>,
    pub alerts: Vec<Alert>,
    pub stats: BTreeMap<String, serde_json::Value>,

    pub started_at: DateTime<Utc>,

    completed_stages: BTreeSet<Stage>,
    skipped_stages: BTreeMap<Stage, SkipReason>,
    phase_times: BTreeMap<Stage, Duration>,
    memory_deltas: BTreeMap<Stage, f64>,

    entity_index: Mutex<EntityIndex>,
    errors: Mutex<Vec<PipelineError>>,
    warnings: Mutex<Vec<String>>,
}

impl AnalysisContext {
    pub fn new(input: DocumentInput) -> Self {
        let document_name = input.name();
        Self {
            run_id: Uuid::new_v4(),
            input,
            document_name,
            full_text: String::new(),
            fingerprint: String::new(),
            chapters: Vec::new(),
            entities: Vec::new(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            quality_issues: Vec::new(),
            inconsistencies: Vec::new(),
            alerts: Vec::new(),
            stats: BTreeMap::new(),
            started_at: Utc::now(),
            completed_stages: BTreeSet::new(),
            skipped_stages: BTreeMap::new(),
            phase_times: BTreeMap::new(),
            memory_deltas: BTreeMap::new(),
            entity_index: Mutex::new(EntityIndex::default()),
            errors: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Entity index (shared with sub-tasks)
    // ═══════════════════════════════════════════════════════════

    /// Index key for an entity name (trimmed, lower-cased).
    pub fn normalize_name(name: &str) -> String {
        name.trim().to_lowercase()
    }

    pub fn get_entity_id(&self, name: &str) -> Option<EntityId> {
        self.entity_index
            .lock()
            .ids
            .get(&Self::normalize_name(name))
            .copied()
    }

    /// Id for `name`, allocating a new one if unseen.
    pub fn register_entity(&self, name: &str) -> EntityId {
        let key = Self::normalize_name(name);
        let mut index = self.entity_index.lock();
        if let Some(id) = index.ids.get(&key) {
            return *id;
        }
        index.next_id += 1;
        let id = index.next_id;
        index.ids.insert(key, id);
        id
    }

    /// Copy of the name→id index; the lock is released before returning.
    pub fn get_entity_map_snapshot(&self) -> BTreeMap<String, EntityId> {
        self.entity_index.lock().ids.clone()
    }

    /// Register `name` and record the entity, or bump its mention count if
    /// already present.
    pub fn add_entity(&mut self, name: &str, kind: EntityKind, confidence: f64) -> EntityId {
        let id = self.register_entity(name);
        match self.entities.iter_mut().find(|e| e.id == id) {
            Some(existing) => {
                existing.mention_count += 1;
                existing.confidence = existing.confidence.max(confidence);
            }
            None => self.entities.push(Entity {
                id,
                name: name.trim().to_string(),
                kind,
                mention_count: 1,
                confidence,
            }),
        }
        id
    }

    // ═══════════════════════════════════════════════════════════
    // Errors and warnings (shared with sub-tasks)
    // ═══════════════════════════════════════════════════════════

    pub fn push_error(&self, error: PipelineError) {
        self.errors.lock().push(error);
    }

    pub fn extend_errors(&self, errors: impl IntoIterator<Item = PipelineError>) {
        self.errors.lock().extend(errors);
    }

    pub fn push_warning(&self, warning: impl Into<String>) {
        self.warnings.lock().push(warning.into());
    }

    pub fn errors(&self) -> Vec<PipelineError> {
        self.errors.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    // ═══════════════════════════════════════════════════════════
    // Stage bookkeeping
    // ═══════════════════════════════════════════════════════════

    /// # Panics
    /// If the stage already has a recorded outcome.
    pub fn mark_completed(&mut self, stage: Stage) {
        self.assert_unrecorded(stage);
        self.completed_stages.insert(stage);
    }

    /// # Panics
    /// If the stage already has a recorded outcome.
    pub fn mark_skipped(&mut self, stage: Stage, reason: SkipReason) {
        self.assert_unrecorded(stage);
        self.skipped_stages.insert(stage, reason);
    }

    fn assert_unrecorded(&self, stage: Stage) {
        assert!(
            !self.completed_stages.contains(&stage) && !self.skipped_stages.contains_key(&stage),
            "stage {} recorded twice",
            stage
        );
    }

    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        if self.completed_stages.contains(&stage) {
            StageStatus::Completed
        } else if let Some(reason) = self.skipped_stages.get(&stage) {
            StageStatus::Skipped(*reason)
        } else {
            StageStatus::NotRun
        }
    }

    pub fn completed_stages(&self) -> &BTreeSet<Stage> {
        &self.completed_stages
    }

    pub fn skipped_stages(&self) -> &BTreeMap<Stage, SkipReason> {
        &self.skipped_stages
    }

    pub fn record_phase(&mut self, stage: Stage, elapsed: Duration, memory_delta_mb: Option<f64>) {
        self.phase_times.insert(stage, elapsed);
        if let Some(delta) = memory_delta_mb {
            self.memory_deltas.insert(stage, delta);
        }
    }

    pub fn phase_times(&self) -> &BTreeMap<Stage, Duration> {
        &self.phase_times
    }

    pub fn memory_deltas(&self) -> &BTreeMap<Stage, f64> {
        &self.memory_deltas
    }

    // ═══════════════════════════════════════════════════════════
    // Preconditions and summaries
    // ═══════════════════════════════════════════════════════════

    pub fn has_text(&self) -> bool {
        !self.full_text.trim().is_empty()
    }

    pub fn has_entities(&self) -> bool {
        !self.entities.is_empty()
    }

    pub fn satisfies(&self, precondition: Precondition) -> bool {
        match precondition {
            Precondition::EntitiesPresent => self.has_entities(),
            Precondition::TextNonEmpty => self.has_text(),
        }
    }

    /// First unmet precondition of `stage`, if any.
    pub fn unmet_precondition(&self, stage: Stage) -> Option<Precondition> {
        stage
            .preconditions()
            .iter()
            .copied()
            .find(|p| !self.satisfies(*p))
    }

    /// Drop quality issues and inconsistencies below `min_confidence`.
    /// Returns how many were removed.
    pub fn retain_confident_findings(&mut self, min_confidence: f64) -> usize {
        let before = self.quality_issues.len() + self.inconsistencies.len();
        self.quality_issues.retain(|i| i.confidence >= min_confidence);
        self.inconsistencies.retain(|i| i.confidence >= min_confidence);
        before - (self.quality_issues.len() + self.inconsistencies.len())
    }

    /// Short description of what the context currently holds.
    pub fn input_summary(&self) -> String {
        format!(
            "text: {} chars, chapters: {}, entities: {}, attributes: {}, relationships: {}",
            self.full_text.chars().count(),
            self.chapters.len(),
            self.entities.len(),
            self.attributes.len(),
            self.relationships.len()
        )
    }

    pub fn set_stat(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.stats.insert(key.into(), value.into());
    }

    /// Freeze the context into the end-of-run report.
    pub fn into_report(self, memory: MemoryReport) -> AnalysisReport {
        AnalysisReport::from_context(self, memory, Utc::now())
    }

    /// Drain the lock-protected collections (used when building the report).
    pub(crate) fn take_shared(&mut self) -> (Vec<PipelineError>, Vec<String>) {
        (
            std::mem::take(self.errors.get_mut()),
            std::mem::take(self.warnings.get_mut()),
        )
    }
}

impl std::fmt::Debug for AnalysisContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisContext")
            .field("run_id", &self.run_id)
            .field("document_name", &self.document_name)
            .field("completed_stages", &self.completed_stages)
            .field("skipped_stages", &self.skipped_stages)
            .field("entities", &self.entities.len())
            .field("errors", &self.errors.lock().len())
            .finish()
    }
}
