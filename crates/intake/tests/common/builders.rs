//! Builders for test configs and file payloads.

#![allow(dead_code)]

use intake::config::IntakeConfig;
use intake::FilePayload;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;

/// Builder for scheduler configs.
///
/// Defaults to an identity of `user-1` and no reconcile timer.
pub struct ConfigBuilder {
    config: IntakeConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = IntakeConfig::default();
        config.owner_id = Some("user-1".to_string());
        config.scheduler.reconcile_delay_ms = 0;
        Self { config }
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.scheduler.max_concurrent = max;
        self
    }

    pub fn auto_start(mut self) -> Self {
        self.config.scheduler.auto_start = true;
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.config.owner_id = None;
        self
    }

    pub fn reconcile_delay_ms(mut self, ms: u64) -> Self {
        self.config.scheduler.reconcile_delay_ms = ms;
        self
    }

    pub fn build(self) -> IntakeConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A JPEG payload of `size` bytes. The bytes are not a real image.
pub fn jpeg(name: &str, size: usize) -> FilePayload {
    FilePayload::with_mime(name, "image/jpeg", vec![0u8; size])
}

pub fn pdf(name: &str, size: usize) -> FilePayload {
    FilePayload::with_mime(name, "application/pdf", vec![0u8; size])
}

pub fn png(name: &str, size: usize) -> FilePayload {
    FilePayload::with_mime(name, "image/png", vec![0u8; size])
}

/// `count` small receipts named `receipt-<n>.jpg`.
pub fn receipts(count: usize) -> Vec<FilePayload> {
    (1..=count)
        .map(|n| jpeg(&format!("receipt-{}.jpg", n), 200 * KB))
        .collect()
}
