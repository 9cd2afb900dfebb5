use serde::{Deserialize, Serialize};

use crate::analysis::catalog::{default_model_id, default_models, MethodLimits, ModelCatalog, ModelProfile};
use crate::analysis::recommendation::default_fallback_triggers;
use crate::analysis::RecommendationEngine;
use crate::error::ConfigError;

pub const CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    pub version: String,
    /// Identity files are uploaded under. Jobs fail with `AUTH_ERROR` without it.
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub recommendation: RecommendationConfig,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            owner_id: None,
            scheduler: SchedulerConfig::default(),
            recommendation: RecommendationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Start draining as soon as files are submitted.
    #[serde(default)]
    pub auto_start: bool,
    /// Delay of the completion re-check after a direct success. 0 disables it.
    #[serde(default = "default_reconcile_delay_ms")]
    pub reconcile_delay_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_reconcile_delay_ms() -> u64 {
    2_000
}

fn default_event_capacity() -> usize {
    256
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            auto_start: false,
            reconcile_delay_ms: default_reconcile_delay_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationConfig {
    #[serde(default)]
    pub limits: MethodLimits,
    #[serde(default = "default_models")]
    pub models: Vec<ModelProfile>,
    #[serde(default = "default_model_id")]
    pub default_model: String,
    /// Case-insensitive substrings marking a processing error as recoverable.
    #[serde(default = "default_fallback_triggers")]
    pub fallback_triggers: Vec<String>,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            limits: MethodLimits::default(),
            models: default_models(),
            default_model: default_model_id(),
            fallback_triggers: default_fallback_triggers(),
        }
    }
}

impl RecommendationConfig {
    pub fn catalog(&self) -> Result<ModelCatalog, ConfigError> {
        ModelCatalog::new(self.models.clone(), &self.default_model)
    }

    pub fn engine(&self) -> Result<RecommendationEngine, ConfigError> {
        Ok(RecommendationEngine::new(
            self.catalog()?,
            self.limits.clone(),
            self.fallback_triggers.clone(),
        ))
    }
}

/// Source format of a config document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Picks the format from a file extension. Anything but yaml/yml is JSON.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}
