//! Scheduler harness over scripted collaborator doubles.
//!
//! `TestHarness` spawns a real `BatchScheduler` against:
//! - `MockStorage` and `MockRecords`, which can be told to fail
//! - `ScriptedProcessing`, which replays a queue of outcomes
//! - the crate's own `InMemoryStatusChannel`
//! - `RecordingQuota`, which records every admission check

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use intake::batch::{BatchSnapshot, JobSnapshot};
use intake::broadcast::{BatchEvent, JobProgressEvent};
use intake::config::IntakeConfig;
use intake::error::{ProcessingFailure, ServiceError};
use intake::services::{
    AdmissionDecision, FilePreprocessor, InMemoryStatusChannel, ProcessingRequest,
    ProcessingService, QuotaService, RecordDraft, RecordService, Services, StatusUpdate,
    StorageUploader, UploadProgress,
};
use intake::{BatchHandle, BatchScheduler, FilePayload, JobId, JobStatus};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct MockStorage {
    pub uploads: Mutex<Vec<(String, u64)>>,
    fail_next: Mutex<Option<String>>,
}

impl MockStorage {
    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageUploader for MockStorage {
    async fn upload(
        &self,
        file: &FilePayload,
        owner_id: &str,
        on_progress: UploadProgress<'_>,
    ) -> Result<String, ServiceError> {
        if let Some(message) = self.fail_next.lock().unwrap().take() {
            return Err(ServiceError::Unavailable(message));
        }
        on_progress(50);
        tokio::task::yield_now().await;
        on_progress(100);
        self.uploads
            .lock()
            .unwrap()
            .push((file.name.clone(), file.size_bytes()));
        Ok(format!("mem://{}/{}", owner_id, file.name))
    }
}

#[derive(Default)]
pub struct MockRecords {
    counter: AtomicUsize,
    pub drafts: Mutex<Vec<RecordDraft>>,
    pub marked: Mutex<Vec<String>>,
    fail_next_create: Mutex<Option<String>>,
}

impl MockRecords {
    pub fn fail_next_create(&self, message: &str) {
        *self.fail_next_create.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl RecordService for MockRecords {
    async fn create_record(&self, draft: RecordDraft) -> Result<String, ServiceError> {
        if let Some(message) = self.fail_next_create.lock().unwrap().take() {
            return Err(ServiceError::Rejected(message));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.drafts.lock().unwrap().push(draft);
        Ok(format!("rec-{}", n))
    }

    async fn mark_uploaded(&self, record_id: &str) -> Result<(), ServiceError> {
        self.marked.lock().unwrap().push(record_id.to_string());
        Ok(())
    }
}

/// One scripted outcome of a `process` call.
#[derive(Clone)]
pub enum Step {
    Succeed,
    Fail(ProcessingFailure),
    /// Never returns until the call is dropped.
    Hang,
    /// Sleeps, then succeeds.
    Delay(Duration),
    /// Publishes the updates on the status channel, then hangs.
    Push(Vec<StatusUpdate>),
    /// Publishes the updates, then succeeds.
    PushThenSucceed(Vec<StatusUpdate>),
}

pub struct ScriptedProcessing {
    status: InMemoryStatusChannel,
    script: Mutex<VecDeque<Step>>,
    default_step: Mutex<Step>,
    pub requests: Mutex<Vec<(String, ProcessingRequest)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProcessing {
    fn new(status: InMemoryStatusChannel) -> Self {
        Self {
            status,
            script: Mutex::new(VecDeque::new()),
            default_step: Mutex::new(Step::Succeed),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queues outcomes consumed in call order.
    pub fn script(&self, steps: Vec<Step>) {
        self.script.lock().unwrap().extend(steps);
    }

    /// Outcome used once the script is exhausted.
    pub fn set_default(&self, step: Step) {
        *self.default_step.lock().unwrap() = step;
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProcessingRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessingService for ScriptedProcessing {
    async fn process(
        &self,
        record_id: &str,
        request: &ProcessingRequest,
    ) -> Result<(), ProcessingFailure> {
        self.requests
            .lock()
            .unwrap()
            .push((record_id.to_string(), request.clone()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_step.lock().unwrap().clone());

        match step {
            Step::Succeed => Ok(()),
            Step::Fail(failure) => Err(failure),
            Step::Hang => std::future::pending().await,
            Step::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Step::Push(updates) => {
                for update in updates {
                    self.status.publish(record_id, update);
                }
                std::future::pending().await
            }
            Step::PushThenSucceed(updates) => {
                for update in updates {
                    self.status.publish(record_id, update);
                }
                Ok(())
            }
        }
    }
}

pub struct RecordingQuota {
    decision: Mutex<AdmissionDecision>,
    pub calls: Mutex<Vec<(usize, f64)>>,
}

impl RecordingQuota {
    pub fn set_decision(&self, decision: AdmissionDecision) {
        *self.decision.lock().unwrap() = decision;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for RecordingQuota {
    fn default() -> Self {
        Self {
            decision: Mutex::new(AdmissionDecision::allow()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl QuotaService for RecordingQuota {
    async fn can_admit_batch(
        &self,
        job_count: usize,
        avg_file_size_mb: f64,
    ) -> Result<AdmissionDecision, ServiceError> {
        self.calls.lock().unwrap().push((job_count, avg_file_size_mb));
        Ok(self.decision.lock().unwrap().clone())
    }
}

/// Preprocessor that always fails.
pub struct BrokenPreprocessor;

#[async_trait]
impl FilePreprocessor for BrokenPreprocessor {
    async fn preprocess(&self, _file: &FilePayload) -> Result<FilePayload, ServiceError> {
        Err(ServiceError::Unavailable("resizer offline".to_string()))
    }
}

pub struct TestHarness {
    pub handle: BatchHandle,
    pub events: broadcast::Receiver<BatchEvent>,
    pub storage: Arc<MockStorage>,
    pub records: Arc<MockRecords>,
    pub processing: Arc<ScriptedProcessing>,
    pub status: InMemoryStatusChannel,
    pub quota: Arc<RecordingQuota>,
}

impl TestHarness {
    pub fn spawn(config: IntakeConfig) -> Self {
        Self::spawn_with(config, |services| services)
    }

    /// Spawns with a hook to adjust the collaborator set.
    pub fn spawn_with(config: IntakeConfig, customize: impl FnOnce(Services) -> Services) -> Self {
        let storage = Arc::new(MockStorage::default());
        let records = Arc::new(MockRecords::default());
        let status = InMemoryStatusChannel::new();
        let processing = Arc::new(ScriptedProcessing::new(status.clone()));
        let quota = Arc::new(RecordingQuota::default());

        let services = Services::new(
            storage.clone(),
            records.clone(),
            processing.clone(),
            Arc::new(status.clone()),
            quota.clone(),
        );

        let handle = BatchScheduler::spawn(&config, customize(services))
            .expect("Failed to spawn scheduler");
        let events = handle.subscribe();

        Self {
            handle,
            events,
            storage,
            records,
            processing,
            status,
            quota,
        }
    }

    /// Waits for the next event matching `predicate`, skipping the rest.
    pub async fn wait_for_event<F>(&mut self, mut predicate: F) -> BatchEvent
    where
        F: FnMut(&BatchEvent) -> bool,
    {
        let events = &mut self.events;
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("Event stream closed")
                    }
                }
            }
        })
        .await
        .expect("Timed out waiting for event")
    }

    /// Waits for the batch to finish. Returns `(succeeded, failed)`.
    pub async fn wait_for_batch(&mut self) -> (usize, usize) {
        match self
            .wait_for_event(|e| matches!(e, BatchEvent::BatchCompleted { .. }))
            .await
        {
            BatchEvent::BatchCompleted { succeeded, failed } => (succeeded, failed),
            _ => unreachable!(),
        }
    }

    /// Collects every job update until the batch finishes.
    pub async fn job_updates_until_batch_end(&mut self) -> (Vec<JobProgressEvent>, (usize, usize)) {
        let mut updates = Vec::new();
        let mut outcome = (0, 0);
        self.wait_for_event(|event| match event {
            BatchEvent::JobUpdated(update) => {
                updates.push(update.clone());
                false
            }
            BatchEvent::BatchCompleted { succeeded, failed } => {
                outcome = (*succeeded, *failed);
                true
            }
            _ => false,
        })
        .await;
        (updates, outcome)
    }

    pub async fn snapshot(&self) -> BatchSnapshot {
        self.handle.snapshot().await.expect("Scheduler stopped")
    }

    pub async fn job(&self, id: &JobId) -> JobSnapshot {
        self.snapshot()
            .await
            .job(id)
            .cloned()
            .expect("Job not in snapshot")
    }

    /// Polls the snapshot until the job reaches `status`.
    pub async fn wait_for_status(&self, id: &JobId, status: JobStatus) -> JobSnapshot {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                if let Some(job) = self.snapshot().await.job(id) {
                    if job.status == status {
                        return job.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for job {} to be {}", id, status))
    }

    /// Polls until the executor has subscribed to the record's status.
    pub async fn wait_for_subscriber(&self, record_id: &str) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            while self.status.subscriber_count(record_id) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Executor never subscribed");
    }

    /// Waits until the job is processing remotely. Returns its record id.
    pub async fn wait_for_remote(&self, id: &JobId) -> String {
        let job = self.wait_for_status(id, JobStatus::Processing).await;
        let record_id = job.record_id.expect("Processing job has no record");
        self.wait_for_subscriber(&record_id).await;
        record_id
    }

    /// Polls until the record has no status subscribers left.
    pub async fn wait_for_unsubscribe(&self, record_id: &str) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            while self.status.subscriber_count(record_id) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Subscription was never closed");
    }
}
