//! Stage identifiers, preconditions and per-stage status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Analysis stage, ordered by pipeline position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parsing,
    BaseExtraction,
    Resolution,
    DeepExtraction,
    Quality,
    Consistency,
    Alerts,
}

impl Stage {
    /// Fixed execution order.
    pub const ALL: [Stage; 7] = [
        Stage::Parsing,
        Stage::BaseExtraction,
        Stage::Resolution,
        Stage::DeepExtraction,
        Stage::Quality,
        Stage::Consistency,
        Stage::Alerts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parsing => "parsing",
            Stage::BaseExtraction => "base_extraction",
            Stage::Resolution => "resolution",
            Stage::DeepExtraction => "deep_extraction",
            Stage::Quality => "quality",
            Stage::Consistency => "consistency",
            Stage::Alerts => "alerts",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Stage::ALL.iter().copied().find(|stage| stage.as_str() == s)
    }

    /// Data that must be present in the context before the stage may run.
    pub fn preconditions(&self) -> &'static [Precondition] {
        match self {
            // Base extraction is the stage that produces entities, so only
            // the text is required here.
            Stage::BaseExtraction | Stage::Quality => &[Precondition::TextNonEmpty],
            Stage::Resolution | Stage::DeepExtraction | Stage::Consistency => {
                &[Precondition::EntitiesPresent]
            }
            Stage::Parsing | Stage::Alerts => &[],
        }
    }

    /// Progress fraction reported just before the stage starts.
    pub fn progress_milestone(&self) -> f64 {
        match self {
            Stage::Parsing => 0.0,
            Stage::BaseExtraction => 0.15,
            Stage::Resolution => 0.35,
            Stage::DeepExtraction => 0.50,
            Stage::Quality => 0.70,
            Stage::Consistency => 0.85,
            Stage::Alerts => 0.95,
        }
    }

    /// What the stage contributes to the context.
    pub fn outputs(&self) -> &'static str {
        match self {
            Stage::Parsing => "text, chapters",
            Stage::BaseExtraction => "entities",
            Stage::Resolution => "merged entities, relationships",
            Stage::DeepExtraction => "attributes, relationships",
            Stage::Quality => "quality issues",
            Stage::Consistency => "inconsistencies",
            Stage::Alerts => "alerts",
        }
    }

    pub fn progress_message(&self) -> &'static str {
        match self {
            Stage::Parsing => "Parsing document...",
            Stage::BaseExtraction => "Base extraction...",
            Stage::Resolution => "Resolving references...",
            Stage::DeepExtraction => "Deep extraction...",
            Stage::Quality => "Quality analysis...",
            Stage::Consistency => "Checking consistency...",
            Stage::Alerts => "Generating alerts...",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Upstream data a stage depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    /// At least one entity in the context.
    EntitiesPresent,
    /// Document text is not empty.
    TextNonEmpty,
}

impl Precondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precondition::EntitiesPresent => "entities present",
            Precondition::TextNonEmpty => "document text non-empty",
        }
    }
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a stage did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Required upstream data absent; never invoked.
    Precondition,
    /// Memory still at danger level after relief; never invoked.
    Resource,
    /// Invoked and returned a (non-fatal) failure.
    Failed,
    /// Turned off by configuration or no handler registered.
    Disabled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Precondition => "skipped_precondition",
            SkipReason::Resource => "skipped_resource",
            SkipReason::Failed => "skipped_failed",
            SkipReason::Disabled => "skipped_disabled",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-stage state.
///
/// ```text
/// NotRun ──► Completed
///        ├─► Skipped(Precondition | Resource | Failed | Disabled)
/// ```
/// A fatal failure ends the whole run instead of producing a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotRun,
    Completed,
    Skipped(SkipReason),
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::NotRun => "not_run",
            StageStatus::Completed => "completed",
            StageStatus::Skipped(reason) => reason.as_str(),
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_matches_all() {
        let mut sorted = Stage::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Stage::ALL.to_vec());
    }

    #[test]
    fn test_name_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_str(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::from_str("reporting"), None);
    }

    #[test]
    fn test_preconditions() {
        assert!(Stage::Parsing.preconditions().is_empty());
        assert!(Stage::Alerts.preconditions().is_empty());
        assert_eq!(Stage::BaseExtraction.preconditions(), &[Precondition::TextNonEmpty]);
        assert_eq!(Stage::Resolution.preconditions(), &[Precondition::EntitiesPresent]);
        assert_eq!(Stage::Quality.preconditions(), &[Precondition::TextNonEmpty]);
    }

    #[test]
    fn test_outputs_named_per_stage() {
        assert_eq!(Stage::Quality.outputs(), "quality issues");
        assert_eq!(Stage::BaseExtraction.outputs(), "entities");
        assert!(Stage::ALL.iter().all(|s| !s.outputs().is_empty()));
    }

    #[test]
    fn test_milestones_increase() {
        let milestones: Vec<f64> = Stage::ALL.iter().map(|s| s.progress_milestone()).collect();
        assert!(milestones.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(milestones[0], 0.0);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&StageStatus::Skipped(SkipReason::Precondition)).unwrap();
        assert_eq!(json, r#"{"skipped":"precondition"}"#);
        assert_eq!(
            serde_json::to_string(&Stage::DeepExtraction).unwrap(),
            r#""deep_extraction""#
        );
    }
}
