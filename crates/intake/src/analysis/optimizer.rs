//! Whole-submission planning: recommendations, concurrency and queue order.

use serde::Serialize;

use super::analyzer::{analyze, Dimensions};
use super::recommendation::{ProcessingRecommendation, RecommendationEngine, RiskLevel, UserPreference};

/// What the optimizer needs to know about one file.
#[derive(Debug, Clone)]
pub struct FileTraits {
    pub size_bytes: u64,
    pub mime_type: String,
    pub dimensions: Option<Dimensions>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPlan {
    /// One entry per input file, in input order.
    pub recommendations: Vec<ProcessingRecommendation>,
    pub concurrency_limit: usize,
    /// Input indices sorted low risk first.
    pub priority_order: Vec<usize>,
    /// Sum of per-file estimates; not adjusted for parallelism.
    pub estimated_total_ms: u64,
}

pub struct BatchOptimizer<'a> {
    engine: &'a RecommendationEngine,
    default_concurrency: usize,
}

impl<'a> BatchOptimizer<'a> {
    pub fn new(engine: &'a RecommendationEngine, default_concurrency: usize) -> Self {
        Self {
            engine,
            default_concurrency: default_concurrency.max(1),
        }
    }

    pub fn plan(&self, files: &[FileTraits], preference: &UserPreference) -> BatchPlan {
        let recommendations: Vec<ProcessingRecommendation> = files
            .iter()
            .map(|file| {
                let analysis = analyze(file.size_bytes, &file.mime_type, file.dimensions);
                self.engine.recommend(file.size_bytes, &analysis, preference)
            })
            .collect();

        let risks: Vec<RiskLevel> = recommendations.iter().map(|r| r.risk_level).collect();
        let estimated_total_ms = recommendations
            .iter()
            .map(|r| r.estimated_processing_ms)
            .sum();

        BatchPlan {
            concurrency_limit: concurrency_limit(&risks, self.default_concurrency),
            priority_order: priority_order(&risks),
            recommendations,
            estimated_total_ms,
        }
    }
}

/// Drops to a single slot when the batch is, on average, riskier than all-medium.
pub fn concurrency_limit(risks: &[RiskLevel], default_limit: usize) -> usize {
    let total: u32 = risks.iter().map(RiskLevel::weight).sum();
    let threshold = 2 * risks.len() as u32;
    if total > threshold {
        1
    } else {
        default_limit.max(1)
    }
}

/// Stable sort of indices by risk, low first.
pub fn priority_order(risks: &[RiskLevel]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..risks.len()).collect();
    order.sort_by_key(|&i| risks[i]);
    order
}
