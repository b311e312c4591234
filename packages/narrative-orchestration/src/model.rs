//! Domain records carried through the pipeline.
//!
//! The orchestrator never inspects these beyond counting them; they exist so
//! stage collaborators exchange concrete types instead of loose maps.

use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type EntityId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub number: u32,
    pub title: String,
    pub start_char: usize,
    pub end_char: usize,
    pub content: String,
}

impl Chapter {
    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    Location,
    Organization,
    Object,
    Event,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub kind: EntityKind,
    pub mention_count: usize,
    pub confidence: f64,
}

/// An attribute asserted about an entity ("eyes: green").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub entity_id: EntityId,
    pub key: String,
    pub value: String,
    pub chapter: Option<u32>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: EntityId,
    pub target: EntityId,
    pub relation: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Spelling,
    Grammar,
    Repetition,
    Coherence,
    Register,
    Pacing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub category: IssueCategory,
    pub message: String,
    pub start_char: usize,
    pub end_char: usize,
    pub suggestion: Option<String>,
    pub confidence: f64,
}

/// Two attribute values that cannot both hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inconsistency {
    pub entity_id: EntityId,
    pub attribute: String,
    pub values: Vec<String>,
    pub chapters: Vec<u32>,
    pub explanation: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// User-facing finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub category: String,
    pub message: String,
    pub source_stage: Stage,
}

impl Alert {
    pub fn new(
        severity: AlertSeverity,
        category: impl Into<String>,
        message: impl Into<String>,
        source_stage: Stage,
    ) -> Self {
        Self {
            severity,
            category: category.into(),
            message: message.into(),
            source_stage,
        }
    }
}
