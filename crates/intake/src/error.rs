use std::path::PathBuf;
use thiserror::Error;

use crate::batch::job::JobId;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Unknown model '{id}'")]
    UnknownModel { id: String },

    #[error("Duplicate model '{id}' in catalog")]
    DuplicateModel { id: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Batch admission denied: {reason}")]
    AdmissionDenied { reason: String },

    #[error("Batch scheduler is no longer running")]
    SchedulerStopped,
}

/// Failure reported by one of the external collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Coarse classification of a processing-service failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ResourceLimit,
    Timeout,
    RateLimited,
    Unavailable,
    Other,
}

impl FailureKind {
    /// Trigger phrase equivalent to this kind, if it is a recoverable class.
    pub fn trigger_phrase(&self) -> Option<&'static str> {
        match self {
            FailureKind::ResourceLimit => Some("resource limit"),
            FailureKind::Timeout => Some("timeout"),
            FailureKind::RateLimited => Some("rate limit"),
            FailureKind::Unavailable => Some("unavailable"),
            FailureKind::Other => None,
        }
    }
}

/// Error raised by the processing service for one `process` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcessingFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ProcessingFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// An unclassified failure; only substring triggers can match it.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to bridge log records: {0}")]
    LogBridge(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

pub type Result<T> = std::result::Result<T, IntakeError>;
