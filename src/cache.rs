//! The media cache service.
//!
//! [`MediaCache`] is constructed explicitly with [`MediaCache::open`] and
//! handed to whoever needs it; clones share the same cache. Call
//! [`MediaCache::shutdown`] to stop background work and flush state.

use crate::config::CacheConfig;
use crate::coordinator::{FetchCoordinator, Priority, Resolution};
use crate::dir::{self, CacheDirectoryProvider};
use crate::download::{ContainerProbe, Downloader, MediaValidator};
use crate::error::{CacheError, Result};
use crate::eviction::{EvictionManager, EvictionPolicy, EvictionReport};
use crate::stats::{BandwidthStats, BandwidthStatsTracker};
use crate::store::MetadataStore;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Fraction of the cap above which a single insert triggers an eviction pass.
const LARGE_INSERT_DIVISOR: u64 = 10;

#[derive(Clone)]
pub struct MediaCache {
    root: Arc<PathBuf>,
    coordinator: FetchCoordinator,
    eviction: EvictionManager,
    store: Arc<Mutex<MetadataStore>>,
    stats: BandwidthStatsTracker,
}

impl MediaCache {
    /// Open the cache described by `config`, using the platform cache
    /// directory unless `config.cache_dir` is set.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        let provider = dir::provider_for(&config);
        Self::open_with(config, provider.as_ref(), Arc::new(ContainerProbe)).await
    }

    /// Open with an explicit directory provider and media validator.
    pub async fn open_with(
        config: CacheConfig,
        provider: &dyn CacheDirectoryProvider,
        validator: Arc<dyn MediaValidator>,
    ) -> Result<Self> {
        config.validate()?;
        let root = dir::ensure_cache_root(provider).await?;

        let store = MetadataStore::load(&root).await;
        store.sweep().await;
        let store = Arc::new(Mutex::new(store));

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(config.max_concurrent_downloads)
            .build()
            .map_err(|e| CacheError::HttpClient(Arc::new(e)))?;
        let downloader = Downloader::new(client, config.download_timeout, validator);

        let stats = BandwidthStatsTracker::new();
        let eviction_trigger = Arc::new(Notify::new());
        let coordinator = FetchCoordinator::new(
            root.clone(),
            store.clone(),
            downloader,
            stats.clone(),
            config.max_concurrent_downloads,
            (config.max_cache_bytes / LARGE_INSERT_DIVISOR).max(1),
            eviction_trigger.clone(),
        );

        let eviction = EvictionManager::new(
            root.clone(),
            store.clone(),
            EvictionPolicy::from_config(&config),
            config.eviction_interval,
        );
        eviction.clone().spawn(
            coordinator.tasks(),
            coordinator.cancellation(),
            eviction_trigger,
        );

        info!(
            "Media cache open at {} ({} entries, cap {} bytes, {} download slots)",
            root.display(),
            store.lock().await.len(),
            config.max_cache_bytes,
            config.max_concurrent_downloads
        );

        Ok(Self {
            root: Arc::new(root),
            coordinator,
            eviction,
            store,
            stats,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the cached path or a handle to wait on. Never waits on the network.
    pub async fn request(&self, url: &str, priority: Priority) -> Result<Resolution> {
        self.coordinator.request(url, priority).await
    }

    /// Return the local path for `url`, downloading it first on a miss.
    ///
    /// On error the caller should fall back to streaming from `url`.
    pub async fn resolve(&self, url: &str, priority: Priority) -> Result<PathBuf> {
        self.request(url, priority).await?.wait().await
    }

    /// Warm the cache for `urls` without waiting for the downloads.
    pub async fn preload<I, S>(&self, urls: I, priority: Priority)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for url in urls {
            let url = url.as_ref();
            if let Err(e) = self.request(url, priority).await {
                debug!("Skipping preload of {}: {}", url, e);
            }
        }
    }

    /// Cached path for `url` if present, without fetching.
    pub async fn cached_path(&self, url: &str) -> Option<PathBuf> {
        self.coordinator.cached_path(url).await
    }

    /// Invalidate one URL. Returns whether it was cached.
    pub async fn remove(&self, url: &str) -> Result<bool> {
        self.coordinator.remove(url).await
    }

    /// Delete everything. In-flight fetches fail with [`CacheError::Cancelled`].
    pub async fn clear(&self) -> Result<()> {
        self.coordinator.clear().await
    }

    /// Run an eviction pass now.
    pub async fn evict_now(&self) -> Result<EvictionReport> {
        self.eviction.run_once().await
    }

    pub fn bandwidth_stats(&self) -> BandwidthStats {
        self.stats.snapshot()
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cancel downloads, stop eviction, wait for background tasks and write
    /// pending access times. Later requests fail with [`CacheError::ShutDown`].
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        let tasks = self.coordinator.tasks();
        tasks.close();
        tasks.wait().await;

        if let Err(e) = self.store.lock().await.flush().await {
            warn!("Failed to flush cache mapping on shutdown: {}", e);
        }
        info!("Media cache at {} shut down", self.root.display());
    }
}
