pub mod analysis;
pub mod batch;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod services;
pub mod telemetry;

pub use analysis::{
    BatchPlan, ProcessingMethod, ProcessingRecommendation, RecommendationEngine, RiskLevel,
    UserPreference,
};
pub use batch::{BatchHandle, BatchScheduler, BatchSnapshot, FilePayload, JobId, JobStatus};
pub use broadcast::{BatchEvent, BatchEventBroadcaster};
pub use config::{load_config, IntakeConfig};
pub use error::{BatchError, ConfigError, IntakeError, ProcessingFailure, Result, ServiceError};
pub use services::Services;
pub use telemetry::{init_tracing, TelemetryOptions};
