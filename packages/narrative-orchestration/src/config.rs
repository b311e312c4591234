//! Pipeline configuration
//!
//! Preset-based defaults (`express`, `standard`, `deep`, `complete`), a
//! versioned YAML schema and `NARRATIVE_*` environment overrides. Stage
//! dependencies are enforced by [`PipelineConfig::validate`], which turns off
//! stages whose upstream is disabled instead of failing.

use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const CONFIG_VERSION: u32 = 1;
const SUPPORTED_VERSIONS: &[u32] = &[CONFIG_VERSION];

pub const ENV_PRESET: &str = "NARRATIVE_PRESET";
pub const ENV_PARALLEL: &str = "NARRATIVE_PARALLEL";
pub const ENV_MAX_WORKERS: &str = "NARRATIVE_MAX_WORKERS";
pub const ENV_MEMORY_WARNING_MB: &str = "NARRATIVE_MEMORY_WARNING_MB";
pub const ENV_HEAVY_TASK_TIMEOUT_MS: &str = "NARRATIVE_HEAVY_TASK_TIMEOUT_MS";

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("Unknown preset '{0}'. Valid presets: express, standard, deep, complete")]
    UnknownPreset(String),

    #[error("Invalid value for '{field}': {value}. {hint}")]
    InvalidValue {
        field: String,
        value: String,
        hint: String,
    },

    #[error("No handler registered for required stage '{0}'")]
    MissingHandler(Stage),

    #[error("YAML parsing error: {0}")]
    Yaml(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    pub fn invalid(field: impl Into<String>, value: impl ToString, hint: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            hint: hint.into(),
        }
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml(e.to_string())
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

// ═══════════════════════════════════════════════════════════
// Presets
// ═══════════════════════════════════════════════════════════

/// Analysis depth profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Structure and spelling/grammar only. No entity stages.
    Express,
    /// Entities, coreference, attributes and basic quality.
    Standard,
    /// Standard plus deep extraction and consistency checks.
    Deep,
    /// Everything enabled.
    Complete,
}

impl Preset {
    pub fn from_str(s: &str) -> ConfigResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "express" => Ok(Self::Express),
            "standard" => Ok(Self::Standard),
            "deep" => Ok(Self::Deep),
            "complete" => Ok(Self::Complete),
            _ => Err(ConfigError::UnknownPreset(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Express => "express",
            Self::Standard => "standard",
            Self::Deep => "deep",
            Self::Complete => "complete",
        }
    }
}

impl Default for Preset {
    fn default() -> Self {
        Self::Standard
    }
}

// ═══════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════

/// Per-stage on/off switches. Parsing is always on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageControl {
    pub base_extraction: bool,
    pub resolution: bool,
    pub deep_extraction: bool,
    pub quality: bool,
    pub consistency: bool,
    pub alerts: bool,
}

impl StageControl {
    pub fn all() -> Self {
        Self {
            base_extraction: true,
            resolution: true,
            deep_extraction: true,
            quality: true,
            consistency: true,
            alerts: true,
        }
    }

    pub fn for_preset(preset: Preset) -> Self {
        match preset {
            Preset::Express => Self {
                base_extraction: false,
                resolution: false,
                deep_extraction: false,
                quality: true,
                consistency: false,
                alerts: true,
            },
            Preset::Standard | Preset::Deep | Preset::Complete => Self::all(),
        }
    }

    pub fn is_enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::Parsing => true,
            Stage::BaseExtraction => self.base_extraction,
            Stage::Resolution => self.resolution,
            Stage::DeepExtraction => self.deep_extraction,
            Stage::Quality => self.quality,
            Stage::Consistency => self.consistency,
            Stage::Alerts => self.alerts,
        }
    }

    /// Toggle a stage. Parsing cannot be disabled; the call is ignored.
    pub fn set(mut self, stage: Stage, enabled: bool) -> Self {
        match stage {
            Stage::Parsing => {}
            Stage::BaseExtraction => self.base_extraction = enabled,
            Stage::Resolution => self.resolution = enabled,
            Stage::DeepExtraction => self.deep_extraction = enabled,
            Stage::Quality => self.quality = enabled,
            Stage::Consistency => self.consistency = enabled,
            Stage::Alerts => self.alerts = enabled,
        }
        self
    }

    pub fn enable(self, stage: Stage) -> Self {
        self.set(stage, true)
    }

    pub fn disable(self, stage: Stage) -> Self {
        self.set(stage, false)
    }
}

impl Default for StageControl {
    fn default() -> Self {
        Self::for_preset(Preset::default())
    }
}

/// Sparse stage switches as written in YAML; unset keys keep the preset value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_extraction: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deep_extraction: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consistency: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts: Option<bool>,
}

impl StageOverrides {
    fn apply(&self, base: StageControl) -> StageControl {
        StageControl {
            base_extraction: self.base_extraction.unwrap_or(base.base_extraction),
            resolution: self.resolution.unwrap_or(base.resolution),
            deep_extraction: self.deep_extraction.unwrap_or(base.deep_extraction),
            quality: self.quality.unwrap_or(base.quality),
            consistency: self.consistency.unwrap_or(base.consistency),
            alerts: self.alerts.unwrap_or(base.alerts),
        }
    }
}

impl From<&StageControl> for StageOverrides {
    fn from(s: &StageControl) -> Self {
        Self {
            base_extraction: Some(s.base_extraction),
            resolution: Some(s.resolution),
            deep_extraction: Some(s.deep_extraction),
            quality: Some(s.quality),
            consistency: Some(s.consistency),
            alerts: Some(s.alerts),
        }
    }
}

/// Sub-task parallelism inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParallelConfig {
    pub enabled: bool,
    /// Upper bound on top of the resource manager's advice.
    pub max_workers: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceConfig {
    /// RSS above which the memory monitor warns (MiB).
    pub memory_warning_threshold_mb: u64,
    /// Wait bound for heavy-task slots; `None` waits indefinitely.
    pub heavy_task_timeout_ms: Option<u64>,
    /// Skip non-fatal stages while memory stays at danger level.
    pub skip_on_memory_danger: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_warning_threshold_mb: narrative_resources::memory::DEFAULT_WARNING_THRESHOLD_MB,
            heavy_task_timeout_ms: Some(300_000),
            skip_on_memory_danger: true,
        }
    }
}

impl ResourceConfig {
    pub fn heavy_task_timeout(&self) -> Option<Duration> {
        self.heavy_task_timeout_ms.map(Duration::from_millis)
    }
}

// ═══════════════════════════════════════════════════════════
// YAML schema v1
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFileV1 {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stages: Option<StageOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel: Option<ParallelConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<ResourceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_confidence: Option<f64>,
}

// ═══════════════════════════════════════════════════════════
// PipelineConfig
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub preset: Preset,
    pub stages: StageControl,
    pub parallel: ParallelConfig,
    pub resources: ResourceConfig,
    /// Quality issues and inconsistencies below this confidence are
    /// dropped after each stage.
    pub min_confidence: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::preset(Preset::default())
    }
}

impl PipelineConfig {
    pub fn preset(preset: Preset) -> Self {
        Self {
            preset,
            stages: StageControl::for_preset(preset),
            parallel: ParallelConfig::default(),
            resources: ResourceConfig::default(),
            min_confidence: 0.5,
        }
    }

    pub fn with_stages<F>(mut self, f: F) -> Self
    where
        F: FnOnce(StageControl) -> StageControl,
    {
        self.stages = f(self.stages);
        self
    }

    pub fn with_parallel<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ParallelConfig) -> ParallelConfig,
    {
        self.parallel = f(self.parallel);
        self
    }

    pub fn with_resources<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ResourceConfig) -> ResourceConfig,
    {
        self.resources = f(self.resources);
        self
    }

    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let file: ConfigFileV1 = serde_yaml::from_str(yaml)?;

        match file.version {
            None => return Err(ConfigError::MissingVersion),
            Some(v) if !SUPPORTED_VERSIONS.contains(&v) => {
                return Err(ConfigError::UnsupportedVersion {
                    found: v,
                    supported: SUPPORTED_VERSIONS.to_vec(),
                })
            }
            Some(_) => {}
        }

        let preset = match file.preset.as_deref() {
            Some(name) => Preset::from_str(name)?,
            None => Preset::default(),
        };

        let mut config = Self::preset(preset);
        if let Some(stages) = &file.stages {
            config.stages = stages.apply(config.stages);
        }
        if let Some(parallel) = file.parallel {
            config.parallel = parallel;
        }
        if let Some(resources) = file.resources {
            config.resources = resources;
        }
        if let Some(min_confidence) = file.min_confidence {
            config.min_confidence = min_confidence;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        debug!("Loading pipeline config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        let file = ConfigFileV1 {
            version: Some(CONFIG_VERSION),
            preset: Some(self.preset.as_str().to_string()),
            stages: Some(StageOverrides::from(&self.stages)),
            parallel: Some(self.parallel.clone()),
            resources: Some(self.resources.clone()),
            min_confidence: Some(self.min_confidence),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    /// Apply `NARRATIVE_*` variables from the process environment.
    pub fn apply_env_overrides(self) -> ConfigResult<Self> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    ///
    /// `NARRATIVE_PRESET` rebuilds stage switches from the new preset, so it
    /// is applied first.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_PRESET) {
            let preset = Preset::from_str(&raw)?;
            if preset != self.preset {
                let parallel = self.parallel.clone();
                let resources = self.resources.clone();
                let min_confidence = self.min_confidence;
                self = Self::preset(preset);
                self.parallel = parallel;
                self.resources = resources;
                self.min_confidence = min_confidence;
            }
        }
        if let Some(raw) = lookup(ENV_PARALLEL) {
            self.parallel.enabled = parse_bool(ENV_PARALLEL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_WORKERS) {
            self.parallel.max_workers = parse_env(ENV_MAX_WORKERS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MEMORY_WARNING_MB) {
            self.resources.memory_warning_threshold_mb = parse_env(ENV_MEMORY_WARNING_MB, &raw)?;
        }
        if let Some(raw) = lookup(ENV_HEAVY_TASK_TIMEOUT_MS) {
            let ms: u64 = parse_env(ENV_HEAVY_TASK_TIMEOUT_MS, &raw)?;
            // 0 means wait forever
            self.resources.heavy_task_timeout_ms = (ms > 0).then_some(ms);
        }

        self.validate()?;
        Ok(self)
    }

    /// Check ranges and resolve stage dependencies.
    ///
    /// Returns the list of stages that were switched off because an upstream
    /// stage is disabled.
    pub fn validate(&mut self) -> ConfigResult<Vec<String>> {
        if self.parallel.max_workers == 0 {
            return Err(ConfigError::invalid(
                "parallel.max_workers",
                0,
                "Use at least 1 worker (set parallel.enabled: false to run sequentially).",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::invalid(
                "min_confidence",
                self.min_confidence,
                "Expected a value in 0.0..=1.0.",
            ));
        }
        if self.resources.memory_warning_threshold_mb == 0 {
            return Err(ConfigError::invalid(
                "resources.memory_warning_threshold_mb",
                0,
                "Expected a positive number of MiB.",
            ));
        }

        let mut adjustments = Vec::new();
        for (stage, upstream) in STAGE_DEPENDENCIES {
            if self.stages.is_enabled(*stage) && !self.stages.is_enabled(*upstream) {
                let note = format!("{} requires {}. Disabling {}.", stage, upstream, stage);
                warn!("{}", note);
                self.stages = self.stages.disable(*stage);
                adjustments.push(note);
            }
        }

        Ok(adjustments)
    }
}

/// `(stage, upstream)` pairs, in pipeline order so disabling cascades.
const STAGE_DEPENDENCIES: &[(Stage, Stage)] = &[
    (Stage::Resolution, Stage::BaseExtraction),
    (Stage::DeepExtraction, Stage::BaseExtraction),
    (Stage::Consistency, Stage::DeepExtraction),
];

fn parse_env<T>(var: &str, raw: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(var, raw, e.to_string()))
}

fn parse_bool(var: &str, raw: &str) -> ConfigResult<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(var, raw, "Expected true/false.")),
    }
}
