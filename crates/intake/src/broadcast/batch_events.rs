//! Batch event broadcaster for real-time job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::analysis::ProcessingRecommendation;
use crate::batch::job::{Job, JobError, JobId, JobStatus};

/// Snapshot of one job after a status change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: JobId,
    pub filename: String,
    pub status: JobStatus,
    /// 0..=100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Set once the remote record exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobProgressEvent {
    pub fn from_job(job: &Job, record_id: Option<&str>) -> Self {
        Self {
            job_id: job.id.clone(),
            filename: job.file.name.clone(),
            status: job.status,
            progress: job.progress,
            error: job.error.clone(),
            record_id: record_id.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    JobQueued {
        job_id: JobId,
        filename: String,
        recommendation: Box<ProcessingRecommendation>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_of: Option<JobId>,
    },
    JobUpdated(JobProgressEvent),
    /// A pending job was dropped from the queue.
    JobRemoved { job_id: JobId },
    BatchCompleted { succeeded: usize, failed: usize },
    AdmissionDenied { reason: String },
    /// User-visible message for a request that changed nothing.
    Notice {
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
        message: String,
    },
}

impl BatchEvent {
    pub fn queued(job: &Job, recommendation: &ProcessingRecommendation) -> Self {
        BatchEvent::JobQueued {
            job_id: job.id.clone(),
            filename: job.file.name.clone(),
            recommendation: Box::new(recommendation.clone()),
            retry_of: job.retry_of.clone(),
        }
    }

    pub fn notice(job_id: Option<&JobId>, message: impl Into<String>) -> Self {
        BatchEvent::Notice {
            job_id: job_id.cloned(),
            message: message.into(),
        }
    }

    /// The job this event is about, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            BatchEvent::JobQueued { job_id, .. } | BatchEvent::JobRemoved { job_id } => {
                Some(job_id)
            }
            BatchEvent::JobUpdated(event) => Some(&event.job_id),
            BatchEvent::Notice { job_id, .. } => job_id.as_ref(),
            BatchEvent::BatchCompleted { .. } | BatchEvent::AdmissionDenied { .. } => None,
        }
    }
}

/// Broadcasts batch events to any number of subscribers.
///
/// Slow subscribers lag and lose events; sending never blocks.
#[derive(Clone)]
pub struct BatchEventBroadcaster {
    sender: Arc<broadcast::Sender<BatchEvent>>,
}

impl BatchEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: BatchEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BatchEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
