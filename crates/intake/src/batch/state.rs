//! The batch aggregate and its single transition function.
//!
//! `BatchState` is owned by the scheduler actor. Every status change goes
//! through [`BatchState::apply`], which keeps the derived id sets in step
//! with `jobs[].status` and drops duplicate signals.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::job::{Job, JobError, JobErrorCode, JobId, JobStatus};
use crate::analysis::catalog::BYTES_PER_MB;
use crate::analysis::ProcessingRecommendation;

/// A requested status change for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub progress: u8,
    pub error: Option<JobError>,
}

impl JobUpdate {
    pub fn uploading(progress: u8) -> Self {
        Self {
            status: JobStatus::Uploading,
            progress,
            error: None,
        }
    }

    pub fn processing(progress: u8) -> Self {
        Self {
            status: JobStatus::Processing,
            progress,
            error: None,
        }
    }

    pub fn completed() -> Self {
        Self {
            status: JobStatus::Completed,
            progress: 100,
            error: None,
        }
    }

    pub fn failed(code: JobErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Error,
            progress: 0,
            error: Some(JobError::new(code, message)),
        }
    }
}

/// Result of feeding a [`JobUpdate`] to the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: JobStatus, to: JobStatus },
    /// Same `(status, progress)` as the current value.
    Duplicate,
    Ignored(IgnoreReason),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    /// True when this transition moved the job into a terminal status.
    pub fn reached_terminal(&self) -> bool {
        matches!(self, Transition::Applied { to, .. } if to.is_terminal())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnknownJob,
    AlreadyTerminal,
    Regression,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    /// Mean progress over all jobs, 0..=100.
    pub overall_progress: u8,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub filename: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<ProcessingRecommendation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<JobId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    pub jobs: Vec<JobSnapshot>,
    pub is_processing: bool,
    pub is_paused: bool,
    pub max_concurrent: usize,
    pub summary: BatchSummary,
}

impl BatchSnapshot {
    pub fn job(&self, id: &JobId) -> Option<&JobSnapshot> {
        self.jobs.iter().find(|j| &j.id == id)
    }
}

#[derive(Debug, Default)]
pub struct BatchState {
    jobs: Vec<Job>,
    is_processing: bool,
    is_paused: bool,
    active_ids: HashSet<JobId>,
    completed_ids: HashSet<JobId>,
    failed_ids: HashSet<JobId>,
    record_ids: HashMap<JobId, String>,
    recommendations: HashMap<JobId, ProcessingRecommendation>,
    /// Pending jobs refused by the quota while the batch was running.
    held: HashSet<JobId>,
}

impl BatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pending job to the end of the queue.
    pub fn enqueue(&mut self, job: Job, recommendation: ProcessingRecommendation) -> JobId {
        let id = job.id.clone();
        self.recommendations.insert(id.clone(), recommendation);
        self.jobs.push(job);
        id
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn recommendation(&self, id: &JobId) -> Option<&ProcessingRecommendation> {
        self.recommendations.get(id)
    }

    pub fn record_id(&self, id: &JobId) -> Option<&str> {
        self.record_ids.get(id).map(String::as_str)
    }

    /// Stores the external record id. Set once; later calls are ignored.
    pub fn set_record_id(&mut self, id: &JobId, record_id: String) -> bool {
        if self.job(id).is_none() || self.record_ids.contains_key(id) {
            return false;
        }
        self.record_ids.insert(id.clone(), record_id);
        true
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    pub fn set_processing(&mut self, processing: bool) {
        self.is_processing = processing;
        if !processing {
            self.is_paused = false;
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.is_paused = paused;
    }

    pub fn active_ids(&self) -> &HashSet<JobId> {
        &self.active_ids
    }

    pub fn completed_ids(&self) -> &HashSet<JobId> {
        &self.completed_ids
    }

    pub fn failed_ids(&self) -> &HashSet<JobId> {
        &self.failed_ids
    }

    /// The reducer. The only place job status, progress and error change.
    pub fn apply(&mut self, id: &JobId, update: JobUpdate) -> Transition {
        let Some(job) = self.jobs.iter_mut().find(|j| &j.id == id) else {
            return Transition::Ignored(IgnoreReason::UnknownJob);
        };

        let from = job.status;
        let to = update.status;
        let progress = match to {
            JobStatus::Completed => 100,
            JobStatus::Error => 0,
            JobStatus::Pending => update.progress.min(100),
            JobStatus::Uploading | JobStatus::Processing => {
                update.progress.min(100).max(if from.is_active() { job.progress } else { 0 })
            }
        };

        if from == to && job.progress == progress {
            return Transition::Duplicate;
        }
        if from.is_terminal() {
            return Transition::Ignored(IgnoreReason::AlreadyTerminal);
        }
        if to < from {
            return Transition::Ignored(IgnoreReason::Regression);
        }

        job.status = to;
        job.progress = progress;
        job.error = match to {
            JobStatus::Error => Some(update.error.unwrap_or_else(|| {
                JobError::new(JobErrorCode::Processing, "Job failed")
            })),
            _ => None,
        };

        match to {
            JobStatus::Uploading | JobStatus::Processing => {
                self.active_ids.insert(id.clone());
            }
            JobStatus::Completed => {
                self.active_ids.remove(id);
                self.completed_ids.insert(id.clone());
            }
            JobStatus::Error => {
                self.active_ids.remove(id);
                self.failed_ids.insert(id.clone());
            }
            JobStatus::Pending => {}
        }

        Transition::Applied { from, to }
    }

    pub fn pending_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .count()
    }

    pub fn pending_ids(&self) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.id.clone())
            .collect()
    }

    /// Mean file size in MB over the given jobs. Unknown ids are skipped.
    pub fn average_size_mb(&self, ids: &[JobId]) -> f64 {
        let sizes: Vec<u64> = ids
            .iter()
            .filter_map(|id| self.job(id))
            .map(|j| j.file.size_bytes())
            .collect();
        if sizes.is_empty() {
            return 0.0;
        }
        let total: u64 = sizes.iter().sum();
        total as f64 / sizes.len() as f64 / BYTES_PER_MB as f64
    }

    /// Keeps pending jobs out of admission until [`BatchState::release_held`].
    pub fn hold(&mut self, ids: &[JobId]) {
        for id in ids {
            if self.job(id).is_some_and(|j| j.status == JobStatus::Pending) {
                self.held.insert(id.clone());
            }
        }
    }

    pub fn release_held(&mut self) -> usize {
        let released = self.held.len();
        self.held.clear();
        released
    }

    pub fn is_held(&self, id: &JobId) -> bool {
        self.held.contains(id)
    }

    /// The first pending jobs, in queue order, that fit in the free slots.
    /// Held jobs are skipped.
    pub fn admissible(&self, max_concurrent: usize) -> Vec<JobId> {
        let free = max_concurrent.saturating_sub(self.active_ids.len());
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending && !self.held.contains(&j.id))
            .take(free)
            .map(|j| j.id.clone())
            .collect()
    }

    /// True once nothing is running and only held jobs, if any, are waiting.
    pub fn is_drained(&self) -> bool {
        self.active_ids.is_empty()
            && self
                .jobs
                .iter()
                .all(|j| j.status != JobStatus::Pending || self.held.contains(&j.id))
    }

    /// Removes a pending job from the queue.
    pub fn remove_pending(&mut self, id: &JobId) -> bool {
        let Some(pos) = self
            .jobs
            .iter()
            .position(|j| &j.id == id && j.status == JobStatus::Pending)
        else {
            return false;
        };
        self.jobs.remove(pos);
        self.recommendations.remove(id);
        self.held.remove(id);
        true
    }

    /// Removes every pending job and returns their ids.
    pub fn clear_pending(&mut self) -> Vec<JobId> {
        let pending: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.id.clone())
            .collect();
        for id in &pending {
            self.remove_pending(id);
        }
        pending
    }

    /// Forgets a failed job's membership in `failed_ids` once it is retried.
    pub(crate) fn release_failed(&mut self, id: &JobId) -> bool {
        self.failed_ids.remove(id)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn summary(&self) -> BatchSummary {
        let total = self.jobs.len();
        let overall_progress = if total == 0 {
            0
        } else {
            let sum: usize = self.jobs.iter().map(|j| usize::from(j.progress)).sum();
            (sum / total) as u8
        };
        BatchSummary {
            total,
            pending: self.pending_count(),
            active: self.active_ids.len(),
            completed: self.completed_ids.len(),
            failed: self.failed_ids.len(),
            overall_progress,
        }
    }

    pub fn snapshot(&self, max_concurrent: usize) -> BatchSnapshot {
        let jobs = self
            .jobs
            .iter()
            .map(|job| JobSnapshot {
                id: job.id.clone(),
                filename: job.file.name.clone(),
                status: job.status,
                progress: job.progress,
                error: job.error.clone(),
                record_id: self.record_ids.get(&job.id).cloned(),
                recommendation: self.recommendations.get(&job.id).cloned(),
                retry_of: job.retry_of.clone(),
            })
            .collect();

        BatchSnapshot {
            jobs,
            is_processing: self.is_processing,
            is_paused: self.is_paused,
            max_concurrent,
            summary: self.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{analyze, RecommendationEngine, UserPreference};
    use crate::batch::job::FilePayload;

    fn enqueue(state: &mut BatchState, name: &str, size: usize) -> JobId {
        let file = FilePayload::new(name, vec![0; size]);
        let analysis = analyze(file.size_bytes(), &file.mime_type, None);
        let rec = RecommendationEngine::default().recommend(
            file.size_bytes(),
            &analysis,
            &UserPreference::default(),
        );
        state.enqueue(Job::new(file), rec)
    }

    #[test]
    fn test_upload_adds_to_active() {
        let mut state = BatchState::new();
        let id = enqueue(&mut state, "a.jpg", 10);

        let t = state.apply(&id, JobUpdate::uploading(0));
        assert_eq!(
            t,
            Transition::Applied {
                from: JobStatus::Pending,
                to: JobStatus::Uploading
            }
        );
        assert!(state.active_ids().contains(&id));
    }

    #[test]
    fn test_completion_forces_full_progress_and_moves_sets() {
        let mut state = BatchState::new();
        let id = enqueue(&mut state, "a.jpg", 10);
        state.apply(&id, JobUpdate::uploading(20));

        let t = state.apply(
            &id,
            JobUpdate {
                status: JobStatus::Completed,
                progress: 42,
                error: None,
            },
        );
        assert!(t.reached_terminal());
        let job = state.job(&id).unwrap();
        assert_eq!(job.progress, 100);
        assert!(!state.active_ids().contains(&id));
        assert!(state.completed_ids().contains(&id));
    }

    #[test]
    fn test_error_forces_zero_progress_and_attaches_error() {
        let mut state = BatchState::new();
        let id = enqueue(&mut state, "a.jpg", 10);
        state.apply(&id, JobUpdate::processing(85));

        state.apply(&id, JobUpdate::failed(JobErrorCode::Upload, "disk full"));
        let job = state.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.progress, 0);
        assert_eq!(job.error.as_ref().unwrap().code, JobErrorCode::Upload);
        assert!(state.failed_ids().contains(&id));
        assert!(state.active_ids().is_empty());
    }

    #[test]
    fn test_duplicate_signal_is_noop() {
        let mut state = BatchState::new();
        let id = enqueue(&mut state, "a.jpg", 10);
        state.apply(&id, JobUpdate::uploading(0));

        assert!(state.apply(&id, JobUpdate::processing(70)).is_applied());
        assert_eq!(state.apply(&id, JobUpdate::processing(70)), Transition::Duplicate);
        assert_eq!(state.job(&id).unwrap().progress, 70);
    }

    #[test]
    fn test_progress_never_decreases_while_active() {
        let mut state = BatchState::new();
        let id = enqueue(&mut state, "a.jpg", 10);
        state.apply(&id, JobUpdate::uploading(40));

        assert_eq!(state.apply(&id, JobUpdate::uploading(30)), Transition::Duplicate);
        assert_eq!(state.job(&id).unwrap().progress, 40);

        state.apply(&id, JobUpdate::processing(10));
        assert_eq!(state.job(&id).unwrap().progress, 40);
        assert_eq!(state.job(&id).unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn test_status_regression_ignored() {
        let mut state = BatchState::new();
        let id = enqueue(&mut state, "a.jpg", 10);
        state.apply(&id, JobUpdate::processing(60));

        assert_eq!(
            state.apply(&id, JobUpdate::uploading(90)),
            Transition::Ignored(IgnoreReason::Regression)
        );
    }

    #[test]
    fn test_terminal_is_final() {
        let mut state = BatchState::new();
        let id = enqueue(&mut state, "a.jpg", 10);
        state.apply(&id, JobUpdate::uploading(0));
        state.apply(&id, JobUpdate::failed(JobErrorCode::Cancelled, "cancelled"));

        assert_eq!(state.apply(&id, JobUpdate::completed()), Transition::Ignored(IgnoreReason::AlreadyTerminal));
        assert_eq!(
            state.apply(&id, JobUpdate::failed(JobErrorCode::Cancelled, "again")),
            Transition::Duplicate
        );
        let job = state.job(&id).unwrap();
        assert_eq!(job.error.as_ref().unwrap().message, "cancelled");
        assert_eq!(state.failed_ids().len(), 1);
        assert!(state.completed_ids().is_empty());
    }

    #[test]
    fn test_completion_signals_converge() {
        let mut state = BatchState::new();
        let id = enqueue(&mut state, "a.jpg", 10);
        state.apply(&id, JobUpdate::processing(85));

        assert!(state.apply(&id, JobUpdate::completed()).reached_terminal());
        assert_eq!(state.apply(&id, JobUpdate::completed()), Transition::Duplicate);
        assert_eq!(state.completed_ids().len(), 1);
    }

    #[test]
    fn test_unknown_job_ignored() {
        let mut state = BatchState::new();
        assert_eq!(
            state.apply(&JobId::new(), JobUpdate::uploading(0)),
            Transition::Ignored(IgnoreReason::UnknownJob)
        );
    }

    #[test]
    fn test_admissible_respects_free_slots_and_order() {
        let mut state = BatchState::new();
        let a = enqueue(&mut state, "a.jpg", 10);
        let b = enqueue(&mut state, "b.jpg", 10);
        let c = enqueue(&mut state, "c.jpg", 10);

        assert_eq!(state.admissible(2), vec![a.clone(), b.clone()]);

        state.apply(&a, JobUpdate::uploading(0));
        assert_eq!(state.admissible(2), vec![b.clone()]);

        state.apply(&b, JobUpdate::uploading(0));
        assert!(state.admissible(2).is_empty());

        state.apply(&a, JobUpdate::completed());
        assert_eq!(state.admissible(2), vec![c]);
    }

    #[test]
    fn test_record_id_set_once() {
        let mut state = BatchState::new();
        let id = enqueue(&mut state, "a.jpg", 10);

        assert!(state.set_record_id(&id, "rec-1".to_string()));
        assert!(!state.set_record_id(&id, "rec-2".to_string()));
        assert_eq!(state.record_id(&id), Some("rec-1"));
        assert!(!state.set_record_id(&JobId::new(), "rec-3".to_string()));
    }

    #[test]
    fn test_remove_and_clear_pending() {
        let mut state = BatchState::new();
        let a = enqueue(&mut state, "a.jpg", 10);
        let b = enqueue(&mut state, "b.jpg", 10);
        let c = enqueue(&mut state, "c.jpg", 10);
        state.apply(&a, JobUpdate::uploading(0));

        assert!(!state.remove_pending(&a));
        assert!(state.remove_pending(&b));
        assert!(state.recommendation(&b).is_none());

        assert_eq!(state.clear_pending(), vec![c.clone()]);
        assert!(state.job(&c).is_none());
        assert_eq!(state.jobs().len(), 1);
    }

    #[test]
    fn test_average_size_over_selected_jobs() {
        let mut state = BatchState::new();
        let a = enqueue(&mut state, "a.jpg", BYTES_PER_MB as usize);
        enqueue(&mut state, "b.jpg", 3 * BYTES_PER_MB as usize);
        assert!((state.average_size_mb(&state.pending_ids()) - 2.0).abs() < f64::EPSILON);
        assert!((state.average_size_mb(&[a]) - 1.0).abs() < f64::EPSILON);
        assert_eq!(state.average_size_mb(&[]), 0.0);
        assert_eq!(state.pending_count(), 2);
    }

    #[test]
    fn test_held_jobs_wait_without_blocking_drain() {
        let mut state = BatchState::new();
        let a = enqueue(&mut state, "a.jpg", 10);
        let b = enqueue(&mut state, "b.jpg", 10);
        let c = enqueue(&mut state, "c.jpg", 10);
        state.apply(&a, JobUpdate::uploading(0));

        state.hold(&[a.clone(), b.clone()]);
        assert!(!state.is_held(&a));
        assert!(state.is_held(&b));
        assert_eq!(state.admissible(3), vec![c.clone()]);

        state.apply(&c, JobUpdate::uploading(0));
        state.apply(&a, JobUpdate::completed());
        state.apply(&c, JobUpdate::completed());
        assert!(state.is_drained());
        assert_eq!(state.pending_count(), 1);

        assert_eq!(state.release_held(), 1);
        assert!(!state.is_drained());
        assert_eq!(state.admissible(3), vec![b]);
    }

    #[test]
    fn test_removing_held_job_forgets_hold() {
        let mut state = BatchState::new();
        let a = enqueue(&mut state, "a.jpg", 10);
        state.hold(&[a.clone()]);

        assert!(state.remove_pending(&a));
        assert!(!state.is_held(&a));
        assert_eq!(state.release_held(), 0);
    }

    #[test]
    fn test_summary_and_snapshot() {
        let mut state = BatchState::new();
        let a = enqueue(&mut state, "a.jpg", 10);
        let b = enqueue(&mut state, "b.jpg", 10);
        state.apply(&a, JobUpdate::uploading(0));
        state.apply(&a, JobUpdate::completed());
        state.apply(&b, JobUpdate::uploading(50));

        let summary = state.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.active, 1);
        assert_eq!(summary.overall_progress, 75);

        let snapshot = state.snapshot(2);
        assert_eq!(snapshot.job(&b).unwrap().progress, 50);
        assert!(snapshot.job(&a).unwrap().recommendation.is_some());
    }

    #[test]
    fn test_reset_discards_everything() {
        let mut state = BatchState::new();
        let a = enqueue(&mut state, "a.jpg", 10);
        state.apply(&a, JobUpdate::uploading(0));
        state.set_processing(true);

        state.reset();
        assert!(state.jobs().is_empty());
        assert!(state.active_ids().is_empty());
        assert!(!state.is_processing());
    }
}
