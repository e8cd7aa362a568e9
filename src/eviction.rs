//! High/low watermark LRU eviction.
//!
//! Nothing happens until the cache root grows past the high watermark; then
//! entries are deleted oldest-access-first until the footprint drops to the
//! low watermark. The gap between the two keeps small overages from causing
//! an eviction on every insert.

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::metrics;
use crate::store::{CacheEntry, MetadataStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvictionPolicy {
    pub max_bytes: u64,
    pub high_watermark: f64,
    pub low_watermark: f64,
}

impl EvictionPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            max_bytes: config.max_cache_bytes,
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
        }
    }

    /// Footprint above which a pass evicts.
    pub fn high_bytes(&self) -> u64 {
        fraction_of(self.max_bytes, self.high_watermark)
    }

    /// Footprint a pass evicts down to.
    pub fn low_bytes(&self) -> u64 {
        fraction_of(self.max_bytes, self.low_watermark)
    }
}

fn fraction_of(bytes: u64, fraction: f64) -> u64 {
    (bytes as f64 * fraction).round() as u64
}

/// Outcome of one eviction pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub footprint_before: u64,
    pub footprint_after: u64,
    /// Evicted keys, oldest first
    pub evicted: Vec<String>,
}

/// Total size of the regular files directly under `root`.
pub async fn footprint(root: &Path) -> Result<u64> {
    let mut dir = tokio::fs::read_dir(root)
        .await
        .map_err(CacheError::io("scanning cache directory"))?;

    let mut total = 0u64;
    while let Some(item) = dir
        .next_entry()
        .await
        .map_err(CacheError::io("scanning cache directory"))?
    {
        // Files can disappear mid-scan
        if let Ok(meta) = item.metadata().await
            && meta.is_file()
        {
            total += meta.len();
        }
    }
    Ok(total)
}

#[derive(Clone)]
pub struct EvictionManager {
    root: PathBuf,
    store: Arc<Mutex<MetadataStore>>,
    policy: EvictionPolicy,
    interval: Duration,
}

impl EvictionManager {
    pub fn new(
        root: PathBuf,
        store: Arc<Mutex<MetadataStore>>,
        policy: EvictionPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            root,
            store,
            policy,
            interval,
        }
    }

    /// Run a single eviction pass.
    ///
    /// Holds the store lock for the whole pass, footprint scan included, so
    /// no mapping mutation or other pass interleaves with it. A candidate
    /// whose file cannot be deleted is skipped and the next-oldest is tried.
    pub async fn run_once(&self) -> Result<EvictionReport> {
        let mut store = self.store.lock().await;
        let before = footprint(&self.root).await?;
        metrics::set_footprint(before);

        if before <= self.policy.high_bytes() {
            debug!(
                "Cache footprint {} bytes is under high watermark {}",
                before,
                self.policy.high_bytes()
            );
            return Ok(EvictionReport {
                footprint_before: before,
                footprint_after: before,
                evicted: Vec::new(),
            });
        }

        let target = self.policy.low_bytes();

        let mut candidates: Vec<CacheEntry> = store.entries().cloned().collect();
        candidates.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut current = before;
        let mut freed = 0u64;
        let mut evicted = Vec::new();

        for entry in candidates {
            if current <= target {
                break;
            }

            let size = match tokio::fs::metadata(&entry.local_path).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };

            match tokio::fs::remove_file(&entry.local_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        "Failed to evict {} ({}): {}",
                        entry.key,
                        entry.local_path.display(),
                        e
                    );
                    continue;
                }
            }

            if let Err(e) = store.remove(&entry.key).await {
                warn!("Evicted {} but failed to persist mapping: {}", entry.key, e);
            }

            current = current.saturating_sub(size);
            freed += size;
            evicted.push(entry.key);
        }

        if let Err(e) = store.flush().await {
            warn!("Failed to flush cache mapping after eviction: {}", e);
        }
        drop(store);

        info!(
            "Evicted {} entries ({} bytes), footprint {} -> {} bytes",
            evicted.len(),
            freed,
            before,
            current
        );
        metrics::record_eviction(evicted.len(), freed);
        metrics::set_footprint(current);

        Ok(EvictionReport {
            footprint_before: before,
            footprint_after: current,
            evicted,
        })
    }

    /// Run passes on every interval tick and whenever `trigger` is notified,
    /// until `cancel` fires. The first pass runs immediately.
    pub fn spawn(self, tasks: &TaskTracker, cancel: CancellationToken, trigger: Arc<Notify>) {
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = trigger.notified() => {
                        debug!("Eviction pass triggered by large insert");
                    }
                }

                if let Err(e) = self.run_once().await {
                    warn!("Eviction pass failed: {}", e);
                }
            }
            debug!("Eviction loop stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    const MB: u64 = 1_000_000;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// Create a sparse file of `len` bytes and register it in the store.
    async fn add(store: &Arc<Mutex<MetadataStore>>, root: &Path, key: &str, len: u64, secs: i64) {
        let path = root.join(key);
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(len).unwrap();
        store
            .lock()
            .await
            .upsert(CacheEntry {
                key: key.to_string(),
                local_path: path,
                last_accessed_at: at(secs),
            })
            .await
            .unwrap();
    }

    async fn manager(root: &Path, max_bytes: u64) -> (EvictionManager, Arc<Mutex<MetadataStore>>) {
        let store = Arc::new(Mutex::new(MetadataStore::load(root).await));
        let policy = EvictionPolicy {
            max_bytes,
            high_watermark: 0.9,
            low_watermark: 0.7,
        };
        let manager = EvictionManager::new(
            root.to_path_buf(),
            store.clone(),
            policy,
            Duration::from_secs(60),
        );
        (manager, store)
    }

    #[test]
    fn watermark_bytes() {
        let policy = EvictionPolicy {
            max_bytes: 100 * MB,
            high_watermark: 0.9,
            low_watermark: 0.7,
        };
        assert_eq!(policy.high_bytes(), 90 * MB);
        assert_eq!(policy.low_bytes(), 70 * MB);
    }

    #[tokio::test]
    async fn under_high_watermark_does_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, store) = manager(tmp.path(), 100 * MB).await;
        add(&store, tmp.path(), "a.mp4", 80 * MB, 1).await;

        let report = manager.run_once().await.unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.footprint_before, report.footprint_after);
        assert_eq!(store.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn evicts_oldest_until_low_watermark() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, store) = manager(tmp.path(), 100 * MB).await;
        add(&store, tmp.path(), "t2.mp4", 33 * MB, 2).await;
        add(&store, tmp.path(), "t1.mp4", 30 * MB, 1).await;
        add(&store, tmp.path(), "t3.mp4", 33 * MB, 3).await;

        let report = manager.run_once().await.unwrap();
        assert!(report.footprint_before > 96 * MB);
        assert_eq!(report.evicted, vec!["t1.mp4"]);
        assert!(report.footprint_after <= 70 * MB);
        assert!(footprint(tmp.path()).await.unwrap() <= 70 * MB);

        assert!(!tmp.path().join("t1.mp4").exists());
        let store = store.lock().await;
        assert!(store.get("t1.mp4").is_none());
        assert!(store.get("t2.mp4").is_some());
        assert!(store.get("t3.mp4").is_some());
    }

    #[tokio::test]
    async fn keeps_evicting_while_above_low_watermark() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, store) = manager(tmp.path(), 100 * MB).await;
        add(&store, tmp.path(), "t1.mp4", 5 * MB, 1).await;
        add(&store, tmp.path(), "t2.mp4", 40 * MB, 2).await;
        add(&store, tmp.path(), "t3.mp4", 51 * MB, 3).await;

        let report = manager.run_once().await.unwrap();
        assert_eq!(report.evicted, vec!["t1.mp4", "t2.mp4"]);
        assert!(report.footprint_after <= 70 * MB);

        // Persisted as well
        let reloaded = MetadataStore::load(tmp.path()).await;
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get("t3.mp4").is_some());
    }

    #[tokio::test]
    async fn ties_break_by_key() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, store) = manager(tmp.path(), 100 * MB).await;
        add(&store, tmp.path(), "bbb.mp4", 30 * MB, 1).await;
        add(&store, tmp.path(), "aaa.mp4", 30 * MB, 1).await;
        add(&store, tmp.path(), "ccc.mp4", 36 * MB, 2).await;

        let report = manager.run_once().await.unwrap();
        assert_eq!(report.evicted, vec!["aaa.mp4"]);
    }

    #[tokio::test]
    async fn undeletable_candidate_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, store) = manager(tmp.path(), 100 * MB).await;

        // A directory where a file is expected: remove_file fails with a non-NotFound error
        let stuck = tmp.path().join("stuck.mp4");
        std::fs::create_dir(&stuck).unwrap();
        store
            .lock()
            .await
            .upsert(CacheEntry {
                key: "stuck.mp4".to_string(),
                local_path: stuck.clone(),
                last_accessed_at: at(0),
            })
            .await
            .unwrap();

        add(&store, tmp.path(), "t2.mp4", 30 * MB, 2).await;
        add(&store, tmp.path(), "t3.mp4", 33 * MB, 3).await;
        add(&store, tmp.path(), "t4.mp4", 33 * MB, 4).await;

        let report = manager.run_once().await.unwrap();
        assert_eq!(report.evicted, vec!["t2.mp4"]);
        assert!(report.footprint_after <= 70 * MB);
        assert!(stuck.is_dir());
        assert!(store.lock().await.get("stuck.mp4").is_some());
    }

    #[tokio::test]
    async fn missing_file_counts_as_evicted() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, store) = manager(tmp.path(), 100 * MB).await;
        add(&store, tmp.path(), "gone.mp4", 1, 1).await;
        std::fs::remove_file(tmp.path().join("gone.mp4")).unwrap();
        add(&store, tmp.path(), "t2.mp4", 30 * MB, 2).await;
        add(&store, tmp.path(), "t3.mp4", 33 * MB, 3).await;
        add(&store, tmp.path(), "t4.mp4", 33 * MB, 4).await;

        let report = manager.run_once().await.unwrap();
        assert_eq!(report.evicted, vec!["gone.mp4", "t2.mp4"]);
        assert!(store.lock().await.get("gone.mp4").is_none());
    }

    #[tokio::test]
    async fn background_loop_runs_on_trigger_and_stops_on_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, store) = manager(tmp.path(), 100 * MB).await;
        // Long interval so only the immediate tick and the trigger run passes
        let manager = EvictionManager {
            interval: Duration::from_secs(3600),
            ..manager
        };

        let tasks = TaskTracker::new();
        let cancel = CancellationToken::new();
        let trigger = Arc::new(Notify::new());
        manager.spawn(&tasks, cancel.clone(), trigger.clone());

        add(&store, tmp.path(), "t1.mp4", 30 * MB, 1).await;
        add(&store, tmp.path(), "t2.mp4", 66 * MB, 2).await;
        trigger.notify_one();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tmp.path().join("t1.mp4").exists() {
            assert!(tokio::time::Instant::now() < deadline, "eviction never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        tasks.close();
        tasks.wait().await;
        assert!(store.lock().await.get("t1.mp4").is_none());
    }
}
