//! Drives one admitted job through upload, record creation and remote
//! processing.
//!
//! The executor never touches `BatchState`. Every observation is sent back
//! to the scheduler through a [`Dispatcher`] and applied by the reducer.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use super::job::{FilePayload, JobErrorCode, JobId};
use super::scheduler::Dispatcher;
use super::state::JobUpdate;
use crate::analysis::ProcessingRecommendation;
use crate::error::ProcessingFailure;
use crate::services::{
    ProcessingRequest, RecordDraft, RemoteStage, Services, StatusUpdate, Subscription,
};

const PREPROCESS_PROGRESS: u8 = 5;
const UPLOAD_START: u8 = 15;
const UPLOAD_END: u8 = 50;
const RECORD_CREATED: u8 = 55;
const PROCESSING_START: u8 = 60;

/// Closes the status subscription when the executor stops, on every path.
struct SubscriptionGuard(Box<dyn Subscription>);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

pub(crate) struct JobExecutor {
    pub id: JobId,
    pub file: FilePayload,
    pub recommendation: ProcessingRecommendation,
    pub owner_id: Option<String>,
    pub services: Services,
    pub dispatch: Dispatcher,
    /// Flips to `true` when the job is cancelled or reaches a terminal state.
    pub cancel: watch::Receiver<bool>,
}

impl JobExecutor {
    pub async fn run(self) {
        let span = info_span!(
            "job",
            job_id = %self.id,
            filename = %self.file.name,
            method = %self.recommendation.recommended_method,
            model = %self.recommendation.recommended_model,
        );

        async move {
            let cancel = self.cancel.clone();
            tokio::select! {
                _ = stopped(cancel) => {
                    debug!("Job stopped, dropping in-flight work");
                }
                _ = self.drive() => {}
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(&self) {
        let Some(owner_id) = self.owner_id.as_deref() else {
            self.fail(JobErrorCode::Auth, "No identity available to upload under");
            return;
        };

        let file = self.preprocess().await;

        let url = {
            let dispatch = self.dispatch.clone();
            let id = self.id.clone();
            let on_progress = move |percent: u8| {
                dispatch.progress(&id, JobUpdate::uploading(upload_band(percent)));
            };
            match self
                .services
                .storage
                .upload(&file, owner_id, &on_progress)
                .instrument(info_span!("upload", size_bytes = file.size_bytes()))
                .await
            {
                Ok(url) => url,
                Err(e) => {
                    self.fail(JobErrorCode::Upload, format!("Upload failed: {}", e));
                    return;
                }
            }
        };
        self.report(JobUpdate::uploading(UPLOAD_END));

        let draft = RecordDraft {
            filename: self.file.name.clone(),
            mime_type: file.mime_type.clone(),
            size_bytes: file.size_bytes(),
            owner_id: owner_id.to_string(),
            storage_url: url,
            method: self.recommendation.recommended_method,
            model: self.recommendation.recommended_model.clone(),
        };
        let record_id = match self
            .services
            .records
            .create_record(draft)
            .instrument(info_span!("create_record"))
            .await
        {
            Ok(record_id) => record_id,
            Err(e) => {
                self.fail(JobErrorCode::Upload, format!("Failed to create record: {}", e));
                return;
            }
        };
        self.dispatch.record_created(&self.id, record_id.clone());
        self.report(JobUpdate::uploading(RECORD_CREATED));

        if let Err(e) = self.services.records.mark_uploaded(&record_id).await {
            self.fail(
                JobErrorCode::Upload,
                format!("Failed to mark record uploaded: {}", e),
            );
            return;
        }
        self.report(JobUpdate::processing(PROCESSING_START));

        self.await_processing(&record_id)
            .instrument(info_span!("process", record_id = %record_id))
            .await;
    }

    /// Races the push status channel against the direct processing call.
    /// Whichever reports a terminal outcome first decides the job.
    async fn await_processing(&self, record_id: &str) {
        let (tx, mut updates) = mpsc::unbounded_channel::<StatusUpdate>();
        let _subscription = SubscriptionGuard(self.services.status.subscribe(
            record_id,
            Box::new(move |update| {
                let _ = tx.send(update);
            }),
        ));

        let direct = self.process_with_fallback(record_id);
        tokio::pin!(direct);

        loop {
            tokio::select! {
                result = &mut direct => {
                    match result {
                        Ok(()) => {
                            info!("Processing call returned success");
                            self.dispatch.direct_success(&self.id);
                        }
                        Err(failure) => {
                            self.fail(JobErrorCode::Processing, failure.message);
                        }
                    }
                    return;
                }
                Some(update) = updates.recv() => {
                    if self.apply_status(update) {
                        return;
                    }
                }
            }
        }
    }

    /// Maps a pushed status to a job update. Returns true once terminal.
    fn apply_status(&self, update: StatusUpdate) -> bool {
        debug!(stage = ?update.stage, "Status update");
        match update.stage {
            RemoteStage::Queued => false,
            RemoteStage::Extracting | RemoteStage::Analyzing => {
                if let Some(progress) = update.stage.progress() {
                    self.report(JobUpdate::processing(progress));
                }
                false
            }
            RemoteStage::Completed => {
                self.report(JobUpdate::completed());
                true
            }
            RemoteStage::Failed(stage) => {
                let message = update
                    .error
                    .unwrap_or_else(|| format!("Remote {:?} stage failed", stage));
                self.fail(stage.error_code(), message);
                true
            }
        }
    }

    /// Calls the processing service, swapping to the fallback method and
    /// model when the failure matches a trigger and attempts remain.
    async fn process_with_fallback(&self, record_id: &str) -> Result<(), ProcessingFailure> {
        let strategy = &self.recommendation.fallback_strategy;
        let mut request = ProcessingRequest {
            method: self.recommendation.recommended_method,
            model: self.recommendation.recommended_model.clone(),
        };
        let mut attempts: u8 = 0;

        loop {
            match self.services.processing.process(record_id, &request).await {
                Ok(()) => return Ok(()),
                Err(failure) if attempts < strategy.max_retries && strategy.matches(&failure) => {
                    attempts += 1;
                    warn!(
                        error = %failure,
                        attempt = attempts,
                        fallback_method = %strategy.fallback_method,
                        fallback_model = %strategy.fallback_model,
                        "Recoverable processing failure, retrying with fallback"
                    );
                    request = ProcessingRequest {
                        method: strategy.fallback_method,
                        model: strategy.fallback_model.clone(),
                    };
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    /// Best-effort. Any failure keeps the original file.
    async fn preprocess(&self) -> FilePayload {
        let Some(preprocessor) = self.services.preprocessor.as_ref().map(Arc::clone) else {
            return self.file.clone();
        };

        self.report(JobUpdate::uploading(PREPROCESS_PROGRESS));
        let file = match preprocessor
            .preprocess(&self.file)
            .instrument(info_span!("preprocess"))
            .await
        {
            Ok(processed) => processed,
            Err(e) => {
                warn!(error = %e, "Pre-processing failed, using original file");
                self.file.clone()
            }
        };
        self.report(JobUpdate::uploading(UPLOAD_START));
        file
    }

    fn report(&self, update: JobUpdate) {
        self.dispatch.progress(&self.id, update);
    }

    fn fail(&self, code: JobErrorCode, message: impl Into<String>) {
        let message = message.into();
        warn!(code = %code, error = %message, "Job failed");
        self.report(JobUpdate::failed(code, message));
    }
}

/// Resolves once the job is flagged to stop or its sender is gone.
async fn stopped(mut cancel: watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// Maps upload percent onto the 15..=50 band.
fn upload_band(percent: u8) -> u8 {
    let percent = u32::from(percent.min(100));
    let span = u32::from(UPLOAD_END - UPLOAD_START);
    UPLOAD_START + (percent * span / 100) as u8
}
