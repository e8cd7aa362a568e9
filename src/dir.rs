//! Cache root resolution.

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use std::path::PathBuf;
use tracing::debug;

/// Resolves where cached media lives on this platform.
pub trait CacheDirectoryProvider: Send + Sync {
    /// Return the cache root. Does not create it.
    fn cache_root(&self) -> Result<PathBuf>;
}

/// A caller-chosen cache root.
#[derive(Clone, Debug)]
pub struct FixedDirectory(pub PathBuf);

impl CacheDirectoryProvider for FixedDirectory {
    fn cache_root(&self) -> Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// `<platform cache dir>/<app_name>/media`, e.g. `~/.cache/reelcache/media`
/// on Linux or `~/Library/Caches/reelcache/media` on macOS.
///
/// Targets without a conventional cache directory fall back to the system
/// temp directory.
#[derive(Clone, Debug)]
pub struct PlatformDirectory {
    app_name: String,
}

impl PlatformDirectory {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

impl CacheDirectoryProvider for PlatformDirectory {
    fn cache_root(&self) -> Result<PathBuf> {
        let base = match dirs::cache_dir() {
            Some(dir) => dir,
            None => {
                debug!("No platform cache directory, falling back to temp dir");
                std::env::temp_dir()
            }
        };
        if self.app_name.is_empty() || self.app_name.contains(['/', '\\']) {
            return Err(CacheError::Config(format!(
                "app_name must be a single path component, got {:?}",
                self.app_name
            )));
        }
        Ok(base.join(&self.app_name).join("media"))
    }
}

/// Pick the provider for `config`: the explicit directory if one is set,
/// otherwise the platform default.
pub fn provider_for(config: &CacheConfig) -> Box<dyn CacheDirectoryProvider> {
    match &config.cache_dir {
        Some(dir) => Box::new(FixedDirectory(dir.clone())),
        None => Box::new(PlatformDirectory::new(config.app_name.clone())),
    }
}

/// Resolve the cache root and make sure it exists.
pub async fn ensure_cache_root(provider: &dyn CacheDirectoryProvider) -> Result<PathBuf> {
    let root = provider.cache_root()?;
    tokio::fs::create_dir_all(&root)
        .await
        .map_err(CacheError::io("creating cache directory"))?;
    Ok(root)
}
