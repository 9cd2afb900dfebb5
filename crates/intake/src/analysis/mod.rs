pub mod analyzer;
pub mod catalog;
pub mod optimizer;
pub mod recommendation;

pub use analyzer::{analyze, probe_dimensions, Complexity, Dimensions, FileAnalysis};
pub use catalog::{MethodLimits, ModelCatalog, ModelProfile, ProcessingMethod};
pub use optimizer::{BatchOptimizer, BatchPlan, FileTraits};
pub use recommendation::{
    Confidence, FallbackStrategy, ProcessingRecommendation, RecommendationEngine, RiskLevel,
    UserPreference,
};
