//! Fetch coordination: cache hits, request coalescing and bounded downloads.
//!
//! Every key has at most one fetch queued or running. Callers asking for a
//! key that is already being fetched subscribe to that fetch's `watch`
//! channel and observe the same outcome. At most `max_concurrent` downloads
//! run at once; the rest wait in a queue that high-priority requests enter
//! at the front.
//!
//! Lock order is coordinator state, then store. The download itself runs
//! with neither held.

use crate::download::{self, Downloaded, Downloader};
use crate::error::{CacheError, Result};
use crate::key::derive_key;
use crate::metrics;
use crate::stats::BandwidthStatsTracker;
use crate::store::{CacheEntry, MetadataStore};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Scheduling priority of a fetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    Normal,
    /// Content the user is about to view; jumps the download queue
    High,
}

/// `None` while the fetch is pending.
type Outcome = Option<Result<PathBuf>>;

/// Result of a non-blocking request.
#[derive(Debug)]
pub enum Resolution {
    /// Already on disk
    Cached(PathBuf),
    /// Being fetched; wait on the handle for the path
    Pending(PendingFetch),
}

impl Resolution {
    pub async fn wait(self) -> Result<PathBuf> {
        match self {
            Resolution::Cached(path) => Ok(path),
            Resolution::Pending(pending) => pending.wait().await,
        }
    }
}

/// Handle onto a queued or running fetch shared by all its waiters.
#[derive(Debug)]
pub struct PendingFetch {
    key: String,
    url: String,
    rx: watch::Receiver<Outcome>,
}

impl PendingFetch {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the fetch to finish.
    pub async fn wait(mut self) -> Result<PathBuf> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(current) => current.clone(),
            // Fetch task went away without reporting
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(CacheError::Cancelled(self.url)))
    }
}

struct Job {
    id: u64,
    key: String,
    url: String,
    tx: watch::Sender<Outcome>,
    /// Cancelled by `clear` or shutdown
    cancel: CancellationToken,
}

struct InFlight {
    job_id: u64,
    rx: watch::Receiver<Outcome>,
}

struct CoordinatorState {
    in_flight: HashMap<String, InFlight>,
    queue: VecDeque<Job>,
    active: usize,
    next_job_id: u64,
    /// Parent token of every job started since the last `clear`
    generation: CancellationToken,
}

impl CoordinatorState {
    /// Move a queued job to the front. Returns false if it is not queued.
    fn promote(&mut self, key: &str) -> bool {
        let Some(pos) = self.queue.iter().position(|job| job.key == key) else {
            return false;
        };
        if let Some(job) = self.queue.remove(pos) {
            self.queue.push_front(job);
        }
        true
    }
}

struct Inner {
    root: PathBuf,
    state: Mutex<CoordinatorState>,
    store: Arc<Mutex<MetadataStore>>,
    downloader: Downloader,
    stats: BandwidthStatsTracker,
    max_concurrent: usize,
    /// Committing a file at least this large triggers an eviction pass
    large_insert_bytes: u64,
    eviction_trigger: Arc<Notify>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

impl FetchCoordinator {
    pub fn new(
        root: PathBuf,
        store: Arc<Mutex<MetadataStore>>,
        downloader: Downloader,
        stats: BandwidthStatsTracker,
        max_concurrent: usize,
        large_insert_bytes: u64,
        eviction_trigger: Arc<Notify>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let state = CoordinatorState {
            in_flight: HashMap::new(),
            queue: VecDeque::new(),
            active: 0,
            next_job_id: 0,
            generation: cancel.child_token(),
        };
        Self {
            inner: Arc::new(Inner {
                root,
                state: Mutex::new(state),
                store,
                downloader,
                stats,
                max_concurrent: max_concurrent.max(1),
                large_insert_bytes,
                eviction_trigger,
                tasks: TaskTracker::new(),
                cancel,
            }),
        }
    }

    /// Tracker for fetch tasks; background tasks of the cache share it.
    pub fn tasks(&self) -> &TaskTracker {
        &self.inner.tasks
    }

    /// Token cancelled on shutdown.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Return the cached path for `url`, or a handle onto its fetch.
    ///
    /// Never waits on the network.
    pub async fn request(&self, url: &str, priority: Priority) -> Result<Resolution> {
        if self.inner.cancel.is_cancelled() {
            return Err(CacheError::ShutDown);
        }

        let key = derive_key(url);
        let mut state = self.inner.state.lock().await;
        // Shutdown may have drained the queue while we waited for the lock
        if self.inner.cancel.is_cancelled() {
            return Err(CacheError::ShutDown);
        }

        if let Some(in_flight) = state.in_flight.get(&key) {
            let rx = in_flight.rx.clone();
            if priority == Priority::High && state.promote(&key) {
                debug!("Promoted queued fetch for {}", url);
            }
            debug!("Coalescing request for {} onto in-flight fetch", url);
            return Ok(Resolution::Pending(PendingFetch {
                key,
                url: url.to_string(),
                rx,
            }));
        }

        {
            let mut store = self.inner.store.lock().await;
            if let Some(path) = store.get(&key).map(|e| e.local_path.clone()) {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    store.touch(&key);
                    metrics::record_lookup(true);
                    debug!("Media cache HIT for {}", url);
                    return Ok(Resolution::Cached(path));
                }
                warn!("Cached file for {} vanished, fetching again", url);
                if let Err(e) = store.remove(&key).await {
                    warn!("Failed to persist removal of {}: {}", key, e);
                }
            }
        }

        metrics::record_lookup(false);
        debug!("Media cache MISS for {}", url);

        let (tx, rx) = watch::channel(None);
        let id = state.next_job_id;
        state.next_job_id += 1;
        state.in_flight.insert(
            key.clone(),
            InFlight {
                job_id: id,
                rx: rx.clone(),
            },
        );
        let job = Job {
            id,
            key: key.clone(),
            url: url.to_string(),
            tx,
            cancel: state.generation.child_token(),
        };

        if state.active < self.inner.max_concurrent {
            state.active += 1;
            self.spawn(job);
        } else {
            debug!(
                "Download slots full ({}), queueing {} with {:?} priority",
                state.active, url, priority
            );
            match priority {
                Priority::High => state.queue.push_front(job),
                Priority::Normal => state.queue.push_back(job),
            }
        }

        Ok(Resolution::Pending(PendingFetch {
            key,
            url: url.to_string(),
            rx,
        }))
    }

    /// Cached path for `url` if present, without touching or fetching.
    pub async fn cached_path(&self, url: &str) -> Option<PathBuf> {
        let key = derive_key(url);
        let path = self.inner.store.lock().await.get(&key)?.local_path.clone();
        tokio::fs::try_exists(&path)
            .await
            .unwrap_or(false)
            .then_some(path)
    }

    /// Drop the entry for `url` and delete its file. Returns whether an entry existed.
    pub async fn remove(&self, url: &str) -> Result<bool> {
        let key = derive_key(url);
        let mut store = self.inner.store.lock().await;
        let Some(entry) = store.remove(&key).await? else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&entry.local_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io("removing cached file")(e)),
        }
        debug!("Removed cached {}", url);
        Ok(true)
    }

    /// Cancel every fetch, wipe the cache directory and start empty.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.generation.cancel();
        state.generation = self.inner.cancel.child_token();
        for job in state.queue.drain(..) {
            job.tx.send_replace(Some(Err(CacheError::Cancelled(job.url))));
        }
        state.in_flight.clear();

        let mut store = self.inner.store.lock().await;
        store.clear();
        match tokio::fs::remove_dir_all(&self.inner.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io("removing cache directory")(e)),
        }
        tokio::fs::create_dir_all(&self.inner.root)
            .await
            .map_err(CacheError::io("recreating cache directory"))?;

        info!("Cleared media cache at {}", self.inner.root.display());
        Ok(())
    }

    /// Stop accepting requests, cancel running downloads and fail queued ones.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        for job in state.queue.drain(..) {
            state.in_flight.remove(&job.key);
            job.tx.send_replace(Some(Err(CacheError::ShutDown)));
        }
    }

    fn spawn(&self, job: Job) {
        let this = self.clone();
        self.inner.tasks.spawn(async move { this.run(job).await });
    }

    async fn run(&self, job: Job) {
        let start = Instant::now();
        info!("Fetching {}", job.url);
        let progress = self.inner.stats.register(&job.key);

        let result = tokio::select! {
            result = self
                .inner
                .downloader
                .fetch(&job.url, &self.inner.root, &job.key, job.id, &progress) => result,
            _ = job.cancel.cancelled() => {
                download::discard(&Downloader::partial_path(&self.inner.root, &job.key, job.id))
                    .await;
                Err(self.cancelled_error(&job))
            }
        };

        self.complete(job, result, start).await;
    }

    fn cancelled_error(&self, job: &Job) -> CacheError {
        if self.inner.cancel.is_cancelled() {
            CacheError::ShutDown
        } else {
            CacheError::Cancelled(job.url.clone())
        }
    }

    async fn complete(&self, job: Job, result: Result<Downloaded>, start: Instant) {
        let mut state = self.inner.state.lock().await;

        let outcome = match result {
            // Finished just as the cache was cleared: the file is stale
            Ok(done) if job.cancel.is_cancelled() => {
                download::discard(&done.path).await;
                Err(self.cancelled_error(&job))
            }
            Ok(done) => Ok(self.commit(&job, done).await),
            Err(e) => Err(e),
        };

        let succeeded = outcome.is_ok();
        self.inner.stats.finish(&job.key, succeeded);
        match &outcome {
            Ok(path) => {
                metrics::record_fetch("success", start);
                info!("Cached {} at {}", job.url, path.display());
            }
            Err(e) => {
                metrics::record_fetch("failure", start);
                warn!("Fetch failed for {}: {}", job.url, e);
            }
        }

        if state
            .in_flight
            .get(&job.key)
            .is_some_and(|f| f.job_id == job.id)
        {
            state.in_flight.remove(&job.key);
        }
        job.tx.send_replace(Some(outcome));

        state.active = state.active.saturating_sub(1);
        self.start_queued(&mut state);
    }

    /// Record a finished download in the store.
    async fn commit(&self, job: &Job, done: Downloaded) -> PathBuf {
        let entry = CacheEntry {
            key: job.key.clone(),
            local_path: done.path.clone(),
            last_accessed_at: Utc::now(),
        };

        let mut store = self.inner.store.lock().await;
        // Entry stays in memory; the mapping file catches up on the next persist.
        if let Err(e) = store.upsert(entry).await {
            warn!("Failed to persist cache mapping after caching {}: {}", job.key, e);
        }
        drop(store);

        if done.bytes >= self.inner.large_insert_bytes {
            debug!("Large insert of {} bytes, requesting eviction pass", done.bytes);
            self.inner.eviction_trigger.notify_one();
        }
        done.path
    }

    fn start_queued(&self, state: &mut CoordinatorState) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        while state.active < self.inner.max_concurrent {
            let Some(job) = state.queue.pop_front() else {
                break;
            };
            state.active += 1;
            self.spawn(job);
        }
    }
}
