use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::{probe_dimensions, Dimensions, FileTraits};

/// Opaque job identifier. Never reused, including across retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a job. Variants are declared in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Uploading,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    /// Statuses during which the job holds a concurrency slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Uploading | JobStatus::Processing)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Uploading => write!(f, "uploading"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobErrorCode {
    /// No identity context to upload under.
    #[serde(rename = "AUTH_ERROR")]
    Auth,
    #[serde(rename = "UPLOAD_ERROR")]
    Upload,
    #[serde(rename = "PROCESSING_ERROR")]
    Processing,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "FETCH_ERROR")]
    Fetch,
    #[serde(rename = "EXTRACTION_ERROR")]
    Extraction,
    #[serde(rename = "ANALYSIS_ERROR")]
    Analysis,
    #[serde(rename = "SAVE_ERROR")]
    Save,
}

impl JobErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorCode::Auth => "AUTH_ERROR",
            JobErrorCode::Upload => "UPLOAD_ERROR",
            JobErrorCode::Processing => "PROCESSING_ERROR",
            JobErrorCode::Cancelled => "CANCELLED",
            JobErrorCode::Fetch => "FETCH_ERROR",
            JobErrorCode::Extraction => "EXTRACTION_ERROR",
            JobErrorCode::Analysis => "ANALYSIS_ERROR",
            JobErrorCode::Save => "SAVE_ERROR",
        }
    }
}

impl std::fmt::Display for JobErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: JobErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: JobErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Immutable input file. Cloning shares the bytes.
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub name: String,
    pub mime_type: String,
    pub data: Arc<[u8]>,
    pub dimensions: Option<Dimensions>,
}

impl FilePayload {
    /// Internal constructor used by all public constructors.
    fn new_internal(
        name: String,
        mime_type: Option<String>,
        data: Vec<u8>,
        dimensions: Option<Dimensions>,
    ) -> Self {
        let mime_type = mime_type
            .or_else(|| Self::detect_mime_type(Path::new(&name)))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let dimensions = dimensions.or_else(|| {
            if mime_type.starts_with("image/") {
                probe_dimensions(&data)
            } else {
                None
            }
        });

        Self {
            name,
            mime_type,
            data: data.into(),
            dimensions,
        }
    }

    /// Creates a payload, detecting the MIME type from the file name and
    /// probing image dimensions from the bytes.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new_internal(name.into(), None, data, None)
    }

    /// Creates a payload with a declared MIME type.
    pub fn with_mime(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new_internal(name.into(), Some(mime_type.into()), data, None)
    }

    /// Overrides the declared pixel dimensions.
    pub fn dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn traits(&self) -> FileTraits {
        FileTraits {
            size_bytes: self.size_bytes(),
            mime_type: self.mime_type.clone(),
            dimensions: self.dimensions,
        }
    }

    /// Detects MIME type from file path using the mime_guess crate.
    /// Returns `None` for unknown extensions.
    fn detect_mime_type(path: &Path) -> Option<String> {
        mime_guess::from_path(path).first().map(|m| m.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub file: FilePayload,
    pub status: JobStatus,
    /// 0..=100.
    pub progress: u8,
    /// Present iff `status` is `Error`.
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    /// The failed job this one was created to retry.
    pub retry_of: Option<JobId>,
}

impl Job {
    pub fn new(file: FilePayload) -> Self {
        Self {
            id: JobId::new(),
            file,
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            created_at: Utc::now(),
            retry_of: None,
        }
    }

    pub fn retry_of(file: FilePayload, original: JobId) -> Self {
        Self {
            retry_of: Some(original),
            ..Self::new(file)
        }
    }
}
