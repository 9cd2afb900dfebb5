//! Job lifecycle, the batch reducer and the scheduler actor that drives it.

mod executor;
pub mod job;
pub mod retry;
pub mod scheduler;
pub mod state;

pub use job::{FilePayload, Job, JobError, JobErrorCode, JobId, JobStatus};
pub use retry::RetryRejection;
pub use scheduler::{BatchHandle, BatchScheduler, SubmitReceipt};
pub use state::{BatchSnapshot, BatchState, BatchSummary, JobSnapshot, JobUpdate, Transition};
