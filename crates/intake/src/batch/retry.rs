//! Retry of failed jobs. The failed job is left untouched; a fresh pending
//! job with a new id takes its place at the end of the queue.

use super::job::{Job, JobErrorCode, JobId, JobStatus};
use super::state::BatchState;

/// Why a retry request was turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryRejection {
    UnknownJob,
    NotFailed(JobStatus),
    Cancelled,
    AlreadyRetried,
    /// The job failed for lack of identity and none is set yet.
    NeedsIdentity,
}

impl std::fmt::Display for RetryRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryRejection::UnknownJob => write!(f, "job does not exist"),
            RetryRejection::NotFailed(status) => write!(f, "job is {}, not failed", status),
            RetryRejection::Cancelled => {
                write!(f, "cancelled jobs must be resubmitted explicitly")
            }
            RetryRejection::AlreadyRetried => write!(f, "job was already retried"),
            RetryRejection::NeedsIdentity => write!(f, "sign in before retrying"),
        }
    }
}

/// Requeues a failed job under a new id, carrying its recommendation over.
pub fn requeue_failed(
    state: &mut BatchState,
    id: &JobId,
    identity_available: bool,
) -> Result<JobId, RetryRejection> {
    let job = state.job(id).ok_or(RetryRejection::UnknownJob)?;
    if job.status != JobStatus::Error {
        return Err(RetryRejection::NotFailed(job.status));
    }
    if !state.failed_ids().contains(id) {
        return Err(RetryRejection::AlreadyRetried);
    }
    match job.error.as_ref().map(|e| e.code) {
        Some(JobErrorCode::Cancelled) => return Err(RetryRejection::Cancelled),
        Some(JobErrorCode::Auth) if !identity_available => {
            return Err(RetryRejection::NeedsIdentity)
        }
        _ => {}
    }

    let recommendation = state
        .recommendation(id)
        .cloned()
        .ok_or(RetryRejection::UnknownJob)?;
    let file = job.file.clone();

    state.release_failed(id);
    Ok(state.enqueue(Job::retry_of(file, id.clone()), recommendation))
}

/// Ids of every failed job that [`requeue_failed`] would accept.
pub fn retryable_ids(state: &BatchState, identity_available: bool) -> Vec<JobId> {
    state
        .jobs()
        .iter()
        .filter(|job| job.status == JobStatus::Error && state.failed_ids().contains(&job.id))
        .filter(|job| match job.error.as_ref().map(|e| e.code) {
            Some(JobErrorCode::Cancelled) => false,
            Some(JobErrorCode::Auth) => identity_available,
            _ => true,
        })
        .map(|job| job.id.clone())
        .collect()
}
