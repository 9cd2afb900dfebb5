//! Per-file choice of processing method, model and fallback plan.

use serde::{Deserialize, Serialize};

use super::analyzer::{Complexity, FileAnalysis};
use super::catalog::{MethodLimits, ModelCatalog, ModelProfile, ProcessingMethod, BYTES_PER_MB};
use crate::error::ProcessingFailure;

const LARGE_FOR_VISION_BYTES: u64 = 4 * BYTES_PER_MB;
const COMPLEX_VISION_CUTOFF_BYTES: u64 = 3 * BYTES_PER_MB;
const SIMPLE_VISION_CUTOFF_BYTES: u64 = 2 * BYTES_PER_MB;
const ACCURACY_CUTOFF_BYTES: u64 = 3 * BYTES_PER_MB;
const SPEED_BIAS_BYTES: u64 = 2 * BYTES_PER_MB;
const HIGH_RISK_DIFFICULTY: u8 = 9;
const LOW_CONFIDENCE_DIFFICULTY: u8 = 7;

pub fn default_fallback_triggers() -> Vec<String> {
    [
        "timeout",
        "timed out",
        "resource limit",
        "rate limit",
        "unavailable",
        "overloaded",
        "too large",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Coarse predictor of processing instability.
/// Ordered so that sorting puts `Low` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn weight(&self) -> u32 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 3,
        }
    }

    fn raise_to(&mut self, floor: RiskLevel) {
        if *self < floor {
            *self = floor;
        }
    }
}

/// Caller hints applied on top of the computed recommendation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreference {
    #[serde(default)]
    pub preferred_method: Option<ProcessingMethod>,
    #[serde(default)]
    pub preferred_model: Option<String>,
    #[serde(default)]
    pub prioritize_speed: bool,
    #[serde(default)]
    pub prioritize_accuracy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackStrategy {
    pub primary_method: ProcessingMethod,
    pub primary_model: String,
    pub fallback_method: ProcessingMethod,
    pub fallback_model: String,
    /// Lowercased substrings that mark an error as recoverable by fallback.
    pub triggers: Vec<String>,
    pub max_retries: u8,
}

impl FallbackStrategy {
    /// True when the failure's kind or message names one of the triggers.
    pub fn matches(&self, failure: &ProcessingFailure) -> bool {
        let message = failure.message.to_lowercase();
        let phrase = failure.kind.trigger_phrase();
        self.triggers
            .iter()
            .any(|t| message.contains(t.as_str()) || phrase == Some(t.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRecommendation {
    pub recommended_method: ProcessingMethod,
    pub recommended_model: String,
    pub confidence: Confidence,
    pub risk_level: RiskLevel,
    pub fallback_strategy: FallbackStrategy,
    /// Advisory estimate in milliseconds.
    pub estimated_processing_ms: u64,
    pub analysis: FileAnalysis,
    pub reasons: Vec<String>,
}

pub struct RecommendationEngine {
    catalog: ModelCatalog,
    limits: MethodLimits,
    triggers: Vec<String>,
}

impl RecommendationEngine {
    pub fn new(catalog: ModelCatalog, limits: MethodLimits, triggers: Vec<String>) -> Self {
        let triggers = triggers
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self {
            catalog,
            limits,
            triggers,
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Builds the recommendation for one file. Later rules override earlier ones.
    pub fn recommend(
        &self,
        size_bytes: u64,
        analysis: &FileAnalysis,
        preference: &UserPreference,
    ) -> ProcessingRecommendation {
        let complexity = analysis.complexity;
        let mut method = ProcessingMethod::AiVision;
        let mut risk = RiskLevel::Low;
        let mut reasons = Vec::new();

        if size_bytes > LARGE_FOR_VISION_BYTES {
            method = ProcessingMethod::OcrAi;
            risk.raise_to(RiskLevel::Medium);
            reasons.push("Large file: OCR+AI handles big payloads more reliably".to_string());
        }

        if complexity == Complexity::High {
            if size_bytes < COMPLEX_VISION_CUTOFF_BYTES {
                method = ProcessingMethod::AiVision;
                reasons.push("Complex layout: AI-vision is more accurate".to_string());
            } else {
                method = ProcessingMethod::OcrAi;
                risk.raise_to(RiskLevel::Medium);
                reasons.push("Large and complex: AI-vision is unstable at this size".to_string());
            }
        }

        if complexity == Complexity::Low && size_bytes < SIMPLE_VISION_CUTOFF_BYTES {
            method = ProcessingMethod::AiVision;
            reasons.push("Simple, small file: AI-vision is fast and accurate".to_string());
        }

        if let Some(preferred) = preference.preferred_method {
            if self.limits.fits(preferred, size_bytes) {
                method = preferred;
                reasons.push(format!("Using preferred method {}", preferred));
            } else {
                risk.raise_to(RiskLevel::Medium);
                reasons.push(format!(
                    "Preferred method {} cannot take this file size, keeping {}",
                    preferred, method
                ));
            }
        }

        let mut model = self.select_model(size_bytes, complexity);

        if let Some(preferred) = preference.preferred_model.as_deref() {
            match self.catalog.get(preferred) {
                Some(profile) if profile.fits(size_bytes) => {
                    model = profile;
                    reasons.push(format!("Using preferred model {}", profile.id));
                }
                Some(_) => {
                    risk.raise_to(RiskLevel::Medium);
                    reasons.push(format!(
                        "Preferred model {} cannot take this file size, keeping {}",
                        preferred, model.id
                    ));
                }
                None => {
                    risk.raise_to(RiskLevel::Medium);
                    reasons.push(format!("Unknown preferred model {}, keeping {}", preferred, model.id));
                }
            }
        }

        if preference.prioritize_speed {
            model = self.catalog.fastest();
            reasons.push("Speed prioritized: using fastest model".to_string());
        }
        if preference.prioritize_accuracy && size_bytes < ACCURACY_CUTOFF_BYTES {
            model = self.catalog.most_accurate();
            reasons.push("Accuracy prioritized: using most accurate model".to_string());
        }

        if !self.limits.fits(method, size_bytes) {
            risk = RiskLevel::High;
            reasons.push(format!("File exceeds the {} size ceiling", method));
        }
        if analysis.difficulty >= HIGH_RISK_DIFFICULTY {
            risk = RiskLevel::High;
            reasons.push(format!("Very difficult file ({}/10)", analysis.difficulty));
        }

        let confidence = if risk == RiskLevel::Low && complexity == Complexity::Low {
            Confidence::High
        } else if risk == RiskLevel::High || analysis.difficulty > LOW_CONFIDENCE_DIFFICULTY {
            Confidence::Low
        } else {
            Confidence::Medium
        };

        let fallback_model = self.select_fallback_model(size_bytes, complexity, &model.id);
        let max_retries = if size_bytes > LARGE_FOR_VISION_BYTES || complexity == Complexity::High
        {
            1
        } else {
            2
        };

        let fallback_strategy = FallbackStrategy {
            primary_method: method,
            primary_model: model.id.clone(),
            fallback_method: method.complement(),
            fallback_model: fallback_model.id.clone(),
            triggers: self.triggers.clone(),
            max_retries,
        };

        ProcessingRecommendation {
            recommended_method: method,
            recommended_model: model.id.clone(),
            confidence,
            risk_level: risk,
            fallback_strategy,
            estimated_processing_ms: estimate_ms(model, size_bytes, complexity),
            analysis: *analysis,
            reasons,
        }
    }

    // Speed for large files, accuracy for complex ones.
    fn select_model(&self, size_bytes: u64, complexity: Complexity) -> &ModelProfile {
        if size_bytes > SPEED_BIAS_BYTES {
            self.catalog.fastest()
        } else if complexity == Complexity::High {
            self.catalog.most_accurate()
        } else {
            self.catalog.default_model()
        }
    }

    fn select_fallback_model(
        &self,
        size_bytes: u64,
        complexity: Complexity,
        primary: &str,
    ) -> &ModelProfile {
        let candidate = if size_bytes > SPEED_BIAS_BYTES {
            self.catalog.fastest_except(primary)
        } else if complexity == Complexity::High {
            self.catalog.most_accurate_except(primary)
        } else if self.catalog.default_model().id != primary {
            Some(self.catalog.default_model())
        } else {
            self.catalog.fastest_except(primary)
        };

        candidate
            .or_else(|| self.catalog.get(primary))
            .unwrap_or_else(|| self.catalog.default_model())
    }
}

impl Default for RecommendationEngine {
    fn default() -> Self {
        Self::new(
            ModelCatalog::default(),
            MethodLimits::default(),
            default_fallback_triggers(),
        )
    }
}

fn estimate_ms(model: &ModelProfile, size_bytes: u64, complexity: Complexity) -> u64 {
    let size_factor = if size_bytes > SPEED_BIAS_BYTES { 1.5 } else { 1.0 };
    let complexity_factor = match complexity {
        Complexity::High => 1.3,
        Complexity::Low => 0.8,
        Complexity::Medium => 1.0,
    };
    (model.avg_processing_ms as f64 * size_factor * complexity_factor).round() as u64
}
