//! Processing methods and the remote model catalog.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// How the remote service extracts data from a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMethod {
    /// Text recognition first, then an AI pass over the recognized text.
    OcrAi,
    /// The AI model reads the document image directly.
    AiVision,
}

impl ProcessingMethod {
    /// The other method; used as the fallback.
    pub fn complement(self) -> Self {
        match self {
            ProcessingMethod::OcrAi => ProcessingMethod::AiVision,
            ProcessingMethod::AiVision => ProcessingMethod::OcrAi,
        }
    }
}

impl std::fmt::Display for ProcessingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingMethod::OcrAi => write!(f, "OCR+AI"),
            ProcessingMethod::AiVision => write!(f, "AI-vision"),
        }
    }
}

/// Largest file each method accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodLimits {
    #[serde(default = "default_ocr_ai_max_mb")]
    pub ocr_ai_max_mb: f64,
    #[serde(default = "default_ai_vision_max_mb")]
    pub ai_vision_max_mb: f64,
}

fn default_ocr_ai_max_mb() -> f64 {
    10.0
}

fn default_ai_vision_max_mb() -> f64 {
    5.0
}

impl Default for MethodLimits {
    fn default() -> Self {
        Self {
            ocr_ai_max_mb: default_ocr_ai_max_mb(),
            ai_vision_max_mb: default_ai_vision_max_mb(),
        }
    }
}

impl MethodLimits {
    pub fn max_bytes(&self, method: ProcessingMethod) -> u64 {
        let mb = match method {
            ProcessingMethod::OcrAi => self.ocr_ai_max_mb,
            ProcessingMethod::AiVision => self.ai_vision_max_mb,
        };
        (mb * BYTES_PER_MB as f64) as u64
    }

    pub fn fits(&self, method: ProcessingMethod, size_bytes: u64) -> bool {
        size_bytes <= self.max_bytes(method)
    }
}

/// A remote model the processing service can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub id: String,
    pub name: String,
    /// Typical wall time for one document, in milliseconds.
    pub avg_processing_ms: u64,
    /// Relative accuracy score, 1 (worst) to 10 (best).
    pub accuracy: u8,
    pub max_file_size_mb: f64,
}

impl ModelProfile {
    pub fn fits(&self, size_bytes: u64) -> bool {
        size_bytes as f64 <= self.max_file_size_mb * BYTES_PER_MB as f64
    }
}

pub fn default_models() -> Vec<ModelProfile> {
    vec![
        ModelProfile {
            id: "vision-lite".to_string(),
            name: "Vision Lite".to_string(),
            avg_processing_ms: 3_000,
            accuracy: 6,
            max_file_size_mb: 10.0,
        },
        ModelProfile {
            id: "vision-standard".to_string(),
            name: "Vision Standard".to_string(),
            avg_processing_ms: 5_000,
            accuracy: 8,
            max_file_size_mb: 10.0,
        },
        ModelProfile {
            id: "vision-pro".to_string(),
            name: "Vision Pro".to_string(),
            avg_processing_ms: 9_000,
            accuracy: 10,
            max_file_size_mb: 5.0,
        },
    ]
}

pub fn default_model_id() -> String {
    "vision-standard".to_string()
}

/// Validated, non-empty set of models with precomputed extremes.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<ModelProfile>,
    default_idx: usize,
    fastest_idx: usize,
    most_accurate_idx: usize,
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelProfile>, default_model: &str) -> Result<Self, ConfigError> {
        if models.is_empty() {
            return Err(ConfigError::Validation {
                message: "Model catalog must contain at least one model".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for model in &models {
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::DuplicateModel {
                    id: model.id.clone(),
                });
            }
        }

        let default_idx = models
            .iter()
            .position(|m| m.id == default_model)
            .ok_or_else(|| ConfigError::UnknownModel {
                id: default_model.to_string(),
            })?;

        let fastest_idx = fastest_index(&models, None).unwrap_or(default_idx);
        let most_accurate_idx = most_accurate_index(&models, None).unwrap_or(default_idx);

        Ok(Self {
            models,
            default_idx,
            fastest_idx,
            most_accurate_idx,
        })
    }

    pub fn get(&self, id: &str) -> Option<&ModelProfile> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn models(&self) -> &[ModelProfile] {
        &self.models
    }

    pub fn default_model(&self) -> &ModelProfile {
        &self.models[self.default_idx]
    }

    pub fn fastest(&self) -> &ModelProfile {
        &self.models[self.fastest_idx]
    }

    pub fn most_accurate(&self) -> &ModelProfile {
        &self.models[self.most_accurate_idx]
    }

    pub fn fastest_except(&self, id: &str) -> Option<&ModelProfile> {
        fastest_index(&self.models, Some(id)).map(|i| &self.models[i])
    }

    pub fn most_accurate_except(&self, id: &str) -> Option<&ModelProfile> {
        most_accurate_index(&self.models, Some(id)).map(|i| &self.models[i])
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let models = default_models();
        Self {
            models,
            default_idx: 1,
            fastest_idx: 0,
            most_accurate_idx: 2,
        }
    }
}

fn fastest_index(models: &[ModelProfile], exclude: Option<&str>) -> Option<usize> {
    models
        .iter()
        .enumerate()
        .filter(|(_, m)| Some(m.id.as_str()) != exclude)
        .min_by_key(|(_, m)| m.avg_processing_ms)
        .map(|(i, _)| i)
}

// Ties on accuracy go to the faster model.
fn most_accurate_index(models: &[ModelProfile], exclude: Option<&str>) -> Option<usize> {
    models
        .iter()
        .enumerate()
        .filter(|(_, m)| Some(m.id.as_str()) != exclude)
        .max_by(|(_, a), (_, b)| {
            a.accuracy
                .cmp(&b.accuracy)
                .then_with(|| b.avg_processing_ms.cmp(&a.avg_processing_ms))
        })
        .map(|(i, _)| i)
}
