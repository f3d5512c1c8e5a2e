//! Transfer counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by consumers and writers
#[derive(Debug, Default)]
pub struct Metrics {
    files_polled: AtomicU64,
    files_delivered: AtomicU64,
    files_committed: AtomicU64,
    files_failed: AtomicU64,
    files_skipped: AtomicU64,
    files_written: AtomicU64,
    bytes_written: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_polled(&self, count: u64) {
        self.files_polled.fetch_add(count, Ordering::Relaxed);
        tracing::trace!(counter = "files_polled", count, "Metric incremented");
    }

    pub fn file_delivered(&self) {
        self.files_delivered.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "files_delivered", "Metric incremented");
    }

    pub fn file_committed(&self) {
        self.files_committed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "files_committed", "Metric incremented");
    }

    pub fn file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "files_failed", "Metric incremented");
    }

    pub fn file_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "files_skipped", "Metric incremented");
    }

    pub fn file_written(&self, bytes: u64) {
        self.files_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        tracing::trace!(counter = "files_written", bytes, "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_polled: self.files_polled.load(Ordering::Relaxed),
            files_delivered: self.files_delivered.load(Ordering::Relaxed),
            files_committed: self.files_committed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            files_written: self.files_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub files_polled: u64,
    pub files_delivered: u64,
    pub files_committed: u64,
    pub files_failed: u64,
    pub files_skipped: u64,
    pub files_written: u64,
    pub bytes_written: u64,
}
