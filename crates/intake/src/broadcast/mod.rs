//! Broadcasting of batch events for real-time streaming.

pub mod batch_events;

pub use batch_events::{BatchEvent, BatchEventBroadcaster, JobProgressEvent};
