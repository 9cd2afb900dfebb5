//! The batch scheduler actor.
//!
//! A single task owns [`BatchState`] and processes [`Command`]s one at a
//! time from an mpsc mailbox, so every mutation is serialized through the
//! reducer. Callers talk to it through a cloneable [`BatchHandle`];
//! executors report back through a [`Dispatcher`].

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::executor::JobExecutor;
use super::job::{FilePayload, Job, JobErrorCode, JobId, JobStatus};
use super::retry::{self, RetryRejection};
use super::state::{BatchSnapshot, BatchState, JobUpdate, Transition};
use crate::analysis::optimizer::concurrency_limit;
use crate::analysis::{BatchOptimizer, BatchPlan, RecommendationEngine, RiskLevel, UserPreference};
use crate::broadcast::{BatchEvent, BatchEventBroadcaster, JobProgressEvent};
use crate::config::IntakeConfig;
use crate::error::{BatchError, ConfigError};
use crate::services::Services;

/// Result of a submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    /// Ids of the new jobs, in input order.
    pub job_ids: Vec<JobId>,
    pub plan: BatchPlan,
    /// Quota reason when the submission was refused admission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission_denied: Option<String>,
}

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    Submit {
        files: Vec<FilePayload>,
        preference: UserPreference,
        reply: Reply<SubmitReceipt>,
    },
    Start {
        reply: Reply<Result<(), BatchError>>,
    },
    Pause {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<Result<(), BatchError>>,
    },
    Cancel {
        id: JobId,
        reply: Reply<Result<(), BatchError>>,
    },
    Retry {
        id: JobId,
        reply: Reply<Result<Option<JobId>, BatchError>>,
    },
    RetryAllFailed {
        reply: Reply<Vec<JobId>>,
    },
    ClearQueue {
        reply: Reply<usize>,
    },
    Reset {
        reply: Reply<()>,
    },
    SetIdentity {
        owner_id: Option<String>,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<BatchSnapshot>,
    },
    Progress {
        id: JobId,
        update: JobUpdate,
    },
    RecordCreated {
        id: JobId,
        record_id: String,
    },
    DirectSuccess {
        id: JobId,
    },
    Reconcile {
        id: JobId,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Executor-side sender. Fire-and-forget; a stopped scheduler drops messages.
///
/// Holds a weak sender so the mailbox closes once every [`BatchHandle`] is
/// gone, even while executors or timers are still in flight.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::WeakUnboundedSender<Command>,
}

impl Dispatcher {
    fn send(&self, command: Command) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(command);
        }
    }

    pub fn progress(&self, id: &JobId, update: JobUpdate) {
        self.send(Command::Progress {
            id: id.clone(),
            update,
        });
    }

    pub fn record_created(&self, id: &JobId, record_id: String) {
        self.send(Command::RecordCreated {
            id: id.clone(),
            record_id,
        });
    }

    pub fn direct_success(&self, id: &JobId) {
        self.send(Command::DirectSuccess { id: id.clone() });
    }
}

/// Cloneable handle to a running scheduler.
#[derive(Clone)]
pub struct BatchHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: BatchEventBroadcaster,
}

impl BatchHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, BatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| BatchError::SchedulerStopped)?;
        rx.await.map_err(|_| BatchError::SchedulerStopped)
    }

    /// Analyzes the files and queues one pending job per file.
    pub async fn submit(
        &self,
        files: Vec<FilePayload>,
        preference: UserPreference,
    ) -> Result<SubmitReceipt, BatchError> {
        self.request(|reply| Command::Submit {
            files,
            preference,
            reply,
        })
        .await
    }

    /// Runs admission control and begins draining the queue.
    pub async fn start(&self) -> Result<(), BatchError> {
        self.request(|reply| Command::Start { reply }).await?
    }

    /// Stops admitting jobs. Running jobs finish.
    pub async fn pause(&self) -> Result<(), BatchError> {
        self.request(|reply| Command::Pause { reply }).await
    }

    /// Re-runs admission control, then continues draining.
    pub async fn resume(&self) -> Result<(), BatchError> {
        self.request(|reply| Command::Resume { reply }).await?
    }

    /// Removes a pending job or fails a running one. Finished jobs are left
    /// alone with a notice.
    pub async fn cancel(&self, id: &JobId) -> Result<(), BatchError> {
        let id = id.clone();
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    /// Requeues a failed job under a new id. `None` when the job is not
    /// retryable; a notice carries the reason.
    pub async fn retry(&self, id: &JobId) -> Result<Option<JobId>, BatchError> {
        let id = id.clone();
        self.request(|reply| Command::Retry { id, reply }).await?
    }

    pub async fn retry_all_failed(&self) -> Result<Vec<JobId>, BatchError> {
        self.request(|reply| Command::RetryAllFailed { reply }).await
    }

    /// Drops every pending job. Returns how many were removed.
    pub async fn clear_queue(&self) -> Result<usize, BatchError> {
        self.request(|reply| Command::ClearQueue { reply }).await
    }

    /// Stops every running job and discards all state.
    pub async fn reset(&self) -> Result<(), BatchError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    pub async fn set_identity(&self, owner_id: Option<String>) -> Result<(), BatchError> {
        self.request(|reply| Command::SetIdentity { owner_id, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<BatchSnapshot, BatchError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Stops the actor. Running jobs are abandoned. Dropping every handle
    /// has the same effect.
    pub async fn shutdown(&self) -> Result<(), BatchError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

pub struct BatchScheduler {
    state: BatchState,
    engine: RecommendationEngine,
    services: Services,
    events: BatchEventBroadcaster,
    owner_id: Option<String>,
    default_concurrency: usize,
    max_concurrent: usize,
    auto_start: bool,
    reconcile_delay: Option<Duration>,
    /// Stop signal per running executor.
    controls: HashMap<JobId, watch::Sender<bool>>,
    dispatch: Dispatcher,
}

impl BatchScheduler {
    /// Spawns the actor on the current tokio runtime.
    pub fn spawn(config: &IntakeConfig, services: Services) -> Result<BatchHandle, ConfigError> {
        let engine = config.recommendation.engine()?;
        let events = BatchEventBroadcaster::new(config.scheduler.event_capacity);
        let (tx, rx) = mpsc::unbounded_channel();

        let scheduler = Self {
            state: BatchState::new(),
            engine,
            services,
            events: events.clone(),
            owner_id: config.owner_id.clone(),
            default_concurrency: config.scheduler.max_concurrent.max(1),
            max_concurrent: config.scheduler.max_concurrent.max(1),
            auto_start: config.scheduler.auto_start,
            reconcile_delay: match config.scheduler.reconcile_delay_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            controls: HashMap::new(),
            dispatch: Dispatcher { tx: tx.downgrade() },
        };

        tokio::spawn(scheduler.run(rx));
        info!(
            "Batch scheduler started (max_concurrent={})",
            config.scheduler.max_concurrent
        );

        Ok(BatchHandle { tx, events })
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Submit {
                    files,
                    preference,
                    reply,
                } => {
                    let receipt = self.submit(files, preference).await;
                    let _ = reply.send(receipt);
                }
                Command::Start { reply } => {
                    let result = self.start().await;
                    let _ = reply.send(result);
                }
                Command::Pause { reply } => {
                    self.pause();
                    let _ = reply.send(());
                }
                Command::Resume { reply } => {
                    let result = self.resume().await;
                    let _ = reply.send(result);
                }
                Command::Cancel { id, reply } => {
                    let _ = reply.send(self.cancel(&id));
                }
                Command::Retry { id, reply } => {
                    let result = self.retry(&id).await;
                    let _ = reply.send(result);
                }
                Command::RetryAllFailed { reply } => {
                    let ids = self.retry_all_failed().await;
                    let _ = reply.send(ids);
                }
                Command::ClearQueue { reply } => {
                    let _ = reply.send(self.clear_queue());
                }
                Command::Reset { reply } => {
                    self.reset();
                    let _ = reply.send(());
                }
                Command::SetIdentity { owner_id, reply } => {
                    debug!("Identity {}", if owner_id.is_some() { "set" } else { "cleared" });
                    self.owner_id = owner_id;
                    let _ = reply.send(());
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.state.snapshot(self.max_concurrent));
                }
                Command::Progress { id, update } => {
                    self.update_job(&id, update);
                }
                Command::RecordCreated { id, record_id } => {
                    if self.state.set_record_id(&id, record_id) {
                        self.emit_job(&id);
                    }
                }
                Command::DirectSuccess { id } => {
                    self.update_job(&id, JobUpdate::completed());
                    self.schedule_reconcile(id);
                }
                Command::Reconcile { id } => {
                    self.reconcile(&id);
                }
                Command::Shutdown { reply } => {
                    self.stop_all();
                    let _ = reply.send(());
                    break;
                }
            }
        }

        self.stop_all();
        info!("Batch scheduler stopped");
    }

    async fn submit(&mut self, files: Vec<FilePayload>, preference: UserPreference) -> SubmitReceipt {
        let traits: Vec<_> = files.iter().map(FilePayload::traits).collect();
        let plan = BatchOptimizer::new(&self.engine, self.default_concurrency).plan(&traits, &preference);

        let mut jobs: Vec<Option<Job>> = files.into_iter().map(|f| Some(Job::new(f))).collect();
        let job_ids: Vec<JobId> = jobs.iter().flatten().map(|job| job.id.clone()).collect();

        // Queue order follows risk, low first
        for &index in &plan.priority_order {
            let Some(job) = jobs[index].take() else {
                continue;
            };
            let recommendation = plan.recommendations[index].clone();
            self.events.send(BatchEvent::queued(&job, &recommendation));
            self.state.enqueue(job, recommendation);
        }

        info!(
            "Queued {} files (suggested concurrency {}, estimated {} ms)",
            job_ids.len(),
            plan.concurrency_limit,
            plan.estimated_total_ms
        );

        let admission_denied = self.after_enqueue(&job_ids).await.err().and_then(|e| match e {
            BatchError::AdmissionDenied { reason } => Some(reason),
            _ => None,
        });

        SubmitReceipt {
            job_ids,
            plan,
            admission_denied,
        }
    }

    /// Admits newly queued work into a running batch, or auto-starts.
    ///
    /// A running batch checks the quota for the new jobs alone and holds
    /// them on denial. A paused batch defers the check to `resume`.
    async fn after_enqueue(&mut self, ids: &[JobId]) -> Result<(), BatchError> {
        if !self.state.is_processing() {
            return if self.auto_start { self.start().await } else { Ok(()) };
        }

        if !self.state.is_paused() {
            if let Err(e) = self.admit(ids).await {
                self.state.hold(ids);
                return Err(e);
            }
        }

        let limit = self.concurrency_for(ids);
        if limit < self.max_concurrent {
            info!("Lowering concurrency {} -> {} for new jobs", self.max_concurrent, limit);
            self.max_concurrent = limit;
        }
        self.drain();
        Ok(())
    }

    async fn start(&mut self) -> Result<(), BatchError> {
        if self.state.is_processing() {
            if self.state.is_paused() {
                return self.resume().await;
            }
            self.events.send(BatchEvent::notice(None, "Batch is already running"));
            return Ok(());
        }

        let pending = self.state.pending_ids();
        self.max_concurrent = self.concurrency_for(&pending);
        self.admit(&pending).await?;
        self.state.release_held();

        info!("Starting batch (max_concurrent={})", self.max_concurrent);
        self.state.set_processing(true);
        self.drain();
        Ok(())
    }

    fn pause(&mut self) {
        if !self.state.is_processing() {
            self.events.send(BatchEvent::notice(None, "Batch is not running"));
            return;
        }
        if self.state.is_paused() {
            self.events.send(BatchEvent::notice(None, "Batch is already paused"));
            return;
        }
        info!("Batch paused");
        self.state.set_paused(true);
    }

    async fn resume(&mut self) -> Result<(), BatchError> {
        if !self.state.is_paused() {
            self.events.send(BatchEvent::notice(None, "Batch is not paused"));
            return Ok(());
        }

        let pending = self.state.pending_ids();
        self.admit(&pending).await?;
        self.state.release_held();

        info!("Batch resumed");
        self.state.set_paused(false);
        self.drain();
        Ok(())
    }

    /// Asks the quota service whether the given jobs may run at all.
    async fn admit(&mut self, ids: &[JobId]) -> Result<(), BatchError> {
        let pending = ids.len();
        if pending == 0 {
            return Ok(());
        }
        let avg_mb = self.state.average_size_mb(ids);

        let reason = match self.services.quota.can_admit_batch(pending, avg_mb).await {
            Ok(decision) if decision.allowed => return Ok(()),
            Ok(decision) => decision
                .reason
                .unwrap_or_else(|| "Batch not allowed by quota".to_string()),
            Err(e) => format!("Quota check failed: {}", e),
        };

        warn!("Admission denied for {} jobs: {}", pending, reason);
        self.events.send(BatchEvent::AdmissionDenied {
            reason: reason.clone(),
        });
        Err(BatchError::AdmissionDenied { reason })
    }

    /// Single slot when the given jobs are, on average, high risk.
    fn concurrency_for(&self, ids: &[JobId]) -> usize {
        let risks: Vec<RiskLevel> = ids
            .iter()
            .filter_map(|id| self.state.recommendation(id))
            .map(|rec| rec.risk_level)
            .collect();
        concurrency_limit(&risks, self.default_concurrency)
    }

    /// One admission pass: fill free slots, or finish the batch.
    fn drain(&mut self) {
        if !self.state.is_processing() || self.state.is_paused() {
            return;
        }

        for id in self.state.admissible(self.max_concurrent) {
            if self.state.apply(&id, JobUpdate::uploading(0)).is_applied() {
                self.emit_job(&id);
                self.launch(&id);
            }
        }

        if self.state.is_drained() {
            self.finish_batch();
        }
    }

    fn launch(&mut self, id: &JobId) {
        let (Some(job), Some(recommendation)) = (self.state.job(id), self.state.recommendation(id))
        else {
            return;
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let executor = JobExecutor {
            id: id.clone(),
            file: job.file.clone(),
            recommendation: recommendation.clone(),
            owner_id: self.owner_id.clone(),
            services: self.services.clone(),
            dispatch: self.dispatch.clone(),
            cancel: stop_rx,
        };
        self.controls.insert(id.clone(), stop_tx);

        debug!("Admitted job {} ({})", id, job.file.name);
        tokio::spawn(executor.run());
    }

    fn finish_batch(&mut self) {
        let succeeded = self.state.completed_ids().len();
        let failed = self.state.failed_ids().len();
        self.state.set_processing(false);
        self.max_concurrent = self.default_concurrency;

        info!("Batch finished: {} succeeded, {} failed", succeeded, failed);
        self.events
            .send(BatchEvent::BatchCompleted { succeeded, failed });
    }

    /// Feeds an update to the reducer and reacts to the transition.
    fn update_job(&mut self, id: &JobId, update: JobUpdate) {
        match self.state.apply(id, update) {
            Transition::Applied { to, .. } => {
                self.emit_job(id);
                if to.is_terminal() {
                    self.stop_executor(id);
                    self.drain();
                }
            }
            Transition::Duplicate => {}
            Transition::Ignored(reason) => {
                debug!("Ignored update for job {}: {:?}", id, reason);
            }
        }
    }

    fn cancel(&mut self, id: &JobId) -> Result<(), BatchError> {
        let status = self
            .state
            .job(id)
            .map(|job| job.status)
            .ok_or_else(|| BatchError::JobNotFound(id.clone()))?;

        match status {
            JobStatus::Pending => {
                self.state.remove_pending(id);
                info!("Removed pending job {}", id);
                self.events.send(BatchEvent::JobRemoved { job_id: id.clone() });
                if self.state.is_processing() {
                    self.drain();
                }
                Ok(())
            }
            JobStatus::Uploading | JobStatus::Processing => {
                info!("Cancelling job {} while {}", id, status);
                self.update_job(id, JobUpdate::failed(JobErrorCode::Cancelled, "Cancelled by user"));
                Ok(())
            }
            JobStatus::Completed | JobStatus::Error => {
                self.events.send(BatchEvent::notice(
                    Some(id),
                    format!("Job is already {} and cannot be cancelled", status),
                ));
                Ok(())
            }
        }
    }

    async fn retry(&mut self, id: &JobId) -> Result<Option<JobId>, BatchError> {
        let new_id = match self.requeue(id) {
            Ok(new_id) => new_id,
            Err(RetryRejection::UnknownJob) => return Err(BatchError::JobNotFound(id.clone())),
            Err(_) => return Ok(None),
        };

        if let Err(e) = self.after_enqueue(std::slice::from_ref(&new_id)).await {
            debug!("Retry of {} queued but not started: {}", id, e);
        }
        Ok(Some(new_id))
    }

    async fn retry_all_failed(&mut self) -> Vec<JobId> {
        let ids = retry::retryable_ids(&self.state, self.owner_id.is_some());
        let new_ids: Vec<JobId> = ids.iter().filter_map(|id| self.requeue(id).ok()).collect();

        if !new_ids.is_empty() {
            info!("Requeued {} failed jobs", new_ids.len());
            if let Err(e) = self.after_enqueue(&new_ids).await {
                debug!("Retried jobs queued but not started: {}", e);
            }
        }
        new_ids
    }

    fn requeue(&mut self, id: &JobId) -> Result<JobId, RetryRejection> {
        match retry::requeue_failed(&mut self.state, id, self.owner_id.is_some()) {
            Ok(new_id) => {
                info!("Job {} requeued as {}", id, new_id);
                if let (Some(job), Some(rec)) =
                    (self.state.job(&new_id), self.state.recommendation(&new_id))
                {
                    self.events.send(BatchEvent::queued(job, rec));
                }
                Ok(new_id)
            }
            Err(rejection) => {
                self.events.send(BatchEvent::notice(
                    Some(id),
                    format!("Cannot retry: {}", rejection),
                ));
                Err(rejection)
            }
        }
    }

    fn clear_queue(&mut self) -> usize {
        let removed = self.state.clear_pending();
        for id in &removed {
            self.events.send(BatchEvent::JobRemoved { job_id: id.clone() });
        }
        if !removed.is_empty() {
            info!("Cleared {} pending jobs", removed.len());
        }
        if self.state.is_processing() {
            self.drain();
        }
        removed.len()
    }

    fn reset(&mut self) {
        info!("Resetting batch ({} jobs)", self.state.jobs().len());
        self.stop_all();
        self.state.reset();
        self.max_concurrent = self.default_concurrency;
    }

    fn schedule_reconcile(&self, id: JobId) {
        let Some(delay) = self.reconcile_delay else {
            return;
        };
        let dispatch = self.dispatch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            dispatch.send(Command::Reconcile { id });
        });
    }

    /// Runs once per direct success, after `reconcile_delay`.
    ///
    /// `DirectSuccess` already applied completion and the reducer accepts it
    /// from every non-terminal status, so the job is normally terminal here
    /// and nothing changes. The forced completion only fires if that update
    /// never reached the reducer.
    fn reconcile(&mut self, id: &JobId) {
        let Some(job) = self.state.job(id) else {
            return;
        };
        if job.status.is_terminal() {
            debug!("Job {} confirmed {}", id, job.status);
            return;
        }
        warn!("Job {} still {} after reported success, completing", id, job.status);
        self.update_job(id, JobUpdate::completed());
    }

    fn stop_executor(&mut self, id: &JobId) {
        if let Some(stop) = self.controls.remove(id) {
            let _ = stop.send(true);
        }
    }

    fn stop_all(&mut self) {
        for (_, stop) in self.controls.drain() {
            let _ = stop.send(true);
        }
    }

    fn emit_job(&self, id: &JobId) {
        if let Some(job) = self.state.job(id) {
            self.events.send(BatchEvent::JobUpdated(JobProgressEvent::from_job(
                job,
                self.state.record_id(id),
            )));
        }
    }
}
