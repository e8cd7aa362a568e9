//! Live bandwidth counters for active downloads.
//!
//! Purely observational: nothing in the cache reads these to make decisions.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counters for one in-flight download.
#[derive(Debug, Default)]
pub struct DownloadProgress {
    downloaded: AtomicU64,
    /// 0 until the response headers report a length
    total: AtomicU64,
}

impl DownloadProgress {
    pub fn add(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Aggregate view over all active downloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BandwidthStats {
    pub active_downloads: usize,
    /// Bytes received so far by active downloads
    pub bytes_transferred: u64,
    /// Sum of announced sizes of active downloads
    pub bytes_expected: u64,
    /// Announced but not yet received
    pub bytes_in_flight: u64,
    /// Lifetime count of successful downloads
    pub completed_downloads: u64,
    /// Lifetime count of failed downloads
    pub failed_downloads: u64,
}

/// Thread-safe registry of per-key download progress.
#[derive(Clone, Debug, Default)]
pub struct BandwidthStatsTracker {
    active: Arc<DashMap<String, Arc<DownloadProgress>>>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl BandwidthStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a download for `key`.
    pub fn register(&self, key: &str) -> Arc<DownloadProgress> {
        let progress = Arc::new(DownloadProgress::default());
        self.active.insert(key.to_string(), progress.clone());
        progress
    }

    /// Stop tracking `key`, counting it as succeeded or failed.
    pub fn finish(&self, key: &str, succeeded: bool) {
        if self.active.remove(key).is_some() {
            let counter = if succeeded { &self.completed } else { &self.failed };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> BandwidthStats {
        let mut stats = BandwidthStats {
            completed_downloads: self.completed.load(Ordering::Relaxed),
            failed_downloads: self.failed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in self.active.iter() {
            let downloaded = entry.downloaded();
            let total = entry.total();
            stats.active_downloads += 1;
            stats.bytes_transferred += downloaded;
            stats.bytes_expected += total;
            stats.bytes_in_flight += total.saturating_sub(downloaded);
        }
        stats
    }
}
