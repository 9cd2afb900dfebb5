//! Contracts for the external collaborators the batch core drives.
//!
//! The core owns no wire protocol. Storage, records, remote processing,
//! the push status channel and admission quota are all injected through
//! the traits below and bundled into [`Services`].

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::analysis::ProcessingMethod;
use crate::batch::job::{FilePayload, JobErrorCode};
use crate::error::{ProcessingFailure, ServiceError};

pub use memory::{InMemoryStatusChannel, StaticQuota};

/// Progress callback handed to the uploader, in percent of the upload.
pub type UploadProgress<'a> = &'a (dyn Fn(u8) + Send + Sync);

#[async_trait]
pub trait StorageUploader: Send + Sync {
    /// Uploads the file under `owner_id` and returns its storage URL.
    async fn upload(
        &self,
        file: &FilePayload,
        owner_id: &str,
        on_progress: UploadProgress<'_>,
    ) -> Result<String, ServiceError>;
}

/// Fields of the persisted record created for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDraft {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub owner_id: String,
    pub storage_url: String,
    pub method: ProcessingMethod,
    pub model: String,
}

#[async_trait]
pub trait RecordService: Send + Sync {
    /// Returns the new record id.
    async fn create_record(&self, draft: RecordDraft) -> Result<String, ServiceError>;

    async fn mark_uploaded(&self, record_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingRequest {
    pub method: ProcessingMethod,
    pub model: String,
}

#[async_trait]
pub trait ProcessingService: Send + Sync {
    /// Runs remote processing for a record. May be called more than once
    /// per record when a fallback is attempted.
    async fn process(
        &self,
        record_id: &str,
        request: &ProcessingRequest,
    ) -> Result<(), ProcessingFailure>;
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn can_admit_batch(
        &self,
        job_count: usize,
        avg_file_size_mb: f64,
    ) -> Result<AdmissionDecision, ServiceError>;
}

/// Best-effort transformation applied before upload (resize, re-encode).
#[async_trait]
pub trait FilePreprocessor: Send + Sync {
    async fn preprocess(&self, file: &FilePayload) -> Result<FilePayload, ServiceError>;
}

/// Remote pipeline stage of a failed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStage {
    Fetch,
    Extraction,
    Analysis,
    Save,
}

impl FailedStage {
    pub fn error_code(&self) -> JobErrorCode {
        match self {
            FailedStage::Fetch => JobErrorCode::Fetch,
            FailedStage::Extraction => JobErrorCode::Extraction,
            FailedStage::Analysis => JobErrorCode::Analysis,
            FailedStage::Save => JobErrorCode::Save,
        }
    }
}

/// Stage reported by the push status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage", content = "failed_at")]
pub enum RemoteStage {
    Queued,
    Extracting,
    Analyzing,
    Completed,
    Failed(FailedStage),
}

impl RemoteStage {
    /// Job progress for an intermediate stage.
    pub fn progress(&self) -> Option<u8> {
        match self {
            RemoteStage::Extracting => Some(70),
            RemoteStage::Analyzing => Some(85),
            RemoteStage::Completed => Some(100),
            RemoteStage::Queued | RemoteStage::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub stage: RemoteStage,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn stage(stage: RemoteStage) -> Self {
        Self { stage, error: None }
    }

    pub fn failed(stage: FailedStage, error: impl Into<String>) -> Self {
        Self {
            stage: RemoteStage::Failed(stage),
            error: Some(error.into()),
        }
    }
}

pub type StatusCallback = Box<dyn Fn(StatusUpdate) + Send + Sync>;

/// Live subscription on the status channel.
pub trait Subscription: Send {
    /// Stops delivery. Calling it again is a no-op.
    fn unsubscribe(&mut self);
}

pub trait StatusChannel: Send + Sync {
    fn subscribe(&self, record_id: &str, on_update: StatusCallback) -> Box<dyn Subscription>;
}

/// The collaborator set a scheduler runs against.
#[derive(Clone)]
pub struct Services {
    pub storage: Arc<dyn StorageUploader>,
    pub records: Arc<dyn RecordService>,
    pub processing: Arc<dyn ProcessingService>,
    pub status: Arc<dyn StatusChannel>,
    pub quota: Arc<dyn QuotaService>,
    pub preprocessor: Option<Arc<dyn FilePreprocessor>>,
}

impl Services {
    pub fn new(
        storage: Arc<dyn StorageUploader>,
        records: Arc<dyn RecordService>,
        processing: Arc<dyn ProcessingService>,
        status: Arc<dyn StatusChannel>,
        quota: Arc<dyn QuotaService>,
    ) -> Self {
        Self {
            storage,
            records,
            processing,
            status,
            quota,
            preprocessor: None,
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn FilePreprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }
}
