//! In-process collaborators: a status hub and a fixed admission policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    AdmissionDecision, QuotaService, StatusCallback, StatusChannel, StatusUpdate, Subscription,
};
use crate::error::ServiceError;

type Subscribers = HashMap<String, Vec<(u64, Arc<StatusCallback>)>>;

#[derive(Default)]
struct Hub {
    next_id: AtomicU64,
    subscribers: Mutex<Subscribers>,
}

impl Hub {
    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, record_id: &str, id: u64) {
        let mut subscribers = self.lock();
        if let Some(list) = subscribers.get_mut(record_id) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                subscribers.remove(record_id);
            }
        }
    }
}

/// Status hub keyed by record id.
///
/// Callbacks run on the publishing thread, outside the internal lock.
#[derive(Clone, Default)]
pub struct InMemoryStatusChannel {
    hub: Arc<Hub>,
}

impl InMemoryStatusChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `update` to every live subscriber of `record_id` and
    /// returns how many received it.
    pub fn publish(&self, record_id: &str, update: StatusUpdate) -> usize {
        let callbacks: Vec<Arc<StatusCallback>> = self
            .hub
            .lock()
            .get(record_id)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        for callback in &callbacks {
            callback(update.clone());
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self, record_id: &str) -> usize {
        self.hub.lock().get(record_id).map_or(0, Vec::len)
    }
}

impl StatusChannel for InMemoryStatusChannel {
    fn subscribe(&self, record_id: &str, on_update: StatusCallback) -> Box<dyn Subscription> {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        self.hub
            .lock()
            .entry(record_id.to_string())
            .or_default()
            .push((id, Arc::new(on_update)));

        Box::new(HubSubscription {
            hub: Arc::clone(&self.hub),
            record_id: record_id.to_string(),
            id,
            active: true,
        })
    }
}

struct HubSubscription {
    hub: Arc<Hub>,
    record_id: String,
    id: u64,
    active: bool,
}

impl Subscription for HubSubscription {
    fn unsubscribe(&mut self) {
        if std::mem::take(&mut self.active) {
            self.hub.remove(&self.record_id, self.id);
        }
    }
}

/// Fixed admission policy. Limits left unset always pass.
#[derive(Debug, Clone, Default)]
pub struct StaticQuota {
    pub max_jobs_per_batch: Option<usize>,
    pub max_avg_file_size_mb: Option<f64>,
}

impl StaticQuota {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn max_jobs(mut self, max: usize) -> Self {
        self.max_jobs_per_batch = Some(max);
        self
    }

    pub fn max_avg_file_size_mb(mut self, max: f64) -> Self {
        self.max_avg_file_size_mb = Some(max);
        self
    }

    pub fn decide(&self, job_count: usize, avg_file_size_mb: f64) -> AdmissionDecision {
        if let Some(max) = self.max_jobs_per_batch {
            if job_count > max {
                return AdmissionDecision::deny(format!(
                    "Batch of {} files exceeds the limit of {}",
                    job_count, max
                ));
            }
        }
        if let Some(max) = self.max_avg_file_size_mb {
            if avg_file_size_mb > max {
                return AdmissionDecision::deny(format!(
                    "Average file size {:.1} MB exceeds the limit of {:.1} MB",
                    avg_file_size_mb, max
                ));
            }
        }
        AdmissionDecision::allow()
    }
}

#[async_trait]
impl QuotaService for StaticQuota {
    async fn can_admit_batch(
        &self,
        job_count: usize,
        avg_file_size_mb: f64,
    ) -> Result<AdmissionDecision, ServiceError> {
        Ok(self.decide(job_count, avg_file_size_mb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{FailedStage, RemoteStage};
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> StatusCallback {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_publish_reaches_matching_record_only() {
        let channel = InMemoryStatusChannel::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let _sa = channel.subscribe("rec-a", counting_callback(&a));
        let _sb = channel.subscribe("rec-b", counting_callback(&b));

        let delivered = channel.publish("rec-a", StatusUpdate::stage(RemoteStage::Extracting));

        assert_eq!(delivered, 1);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let channel = InMemoryStatusChannel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut sub = channel.subscribe("rec-1", counting_callback(&hits));
        assert_eq!(channel.subscriber_count("rec-1"), 1);

        sub.unsubscribe();
        sub.unsubscribe();

        assert_eq!(channel.subscriber_count("rec-1"), 0);
        assert_eq!(
            channel.publish("rec-1", StatusUpdate::failed(FailedStage::Fetch, "gone")),
            0
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_leaves_other_subscribers() {
        let channel = InMemoryStatusChannel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut first = channel.subscribe("rec-1", counting_callback(&hits));
        let _second = channel.subscribe("rec-1", counting_callback(&hits));

        first.unsubscribe();

        assert_eq!(channel.publish("rec-1", StatusUpdate::stage(RemoteStage::Completed)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_static_quota_limits() {
        let quota = StaticQuota::unlimited().max_jobs(2).max_avg_file_size_mb(4.0);

        assert!(quota.decide(2, 3.9).allowed);

        let too_many = quota.decide(3, 1.0);
        assert!(!too_many.allowed);
        assert!(too_many.reason.unwrap().contains("limit of 2"));

        let too_big = quota.decide(1, 4.5);
        assert!(!too_big.allowed);
        assert!(too_big.reason.unwrap().contains("4.5 MB"));
    }

    #[tokio::test]
    async fn test_unlimited_quota_admits() {
        let decision = StaticQuota::unlimited()
            .can_admit_batch(1_000, 500.0)
            .await
            .unwrap();
        assert!(decision.allowed);
    }
}
