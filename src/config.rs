use crate::error::{CacheError, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default cache budget: 2 GiB
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default number of simultaneous downloads
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

pub const DEFAULT_HIGH_WATERMARK: f64 = 0.9;
pub const DEFAULT_LOW_WATERMARK: f64 = 0.7;

/// Default eviction interval: 30 minutes
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default whole-download timeout: 10 minutes
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Media cache configuration
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Explicit cache root. When `None` the platform cache directory is used.
    pub cache_dir: Option<PathBuf>,
    /// Subdirectory name under the platform cache directory
    pub app_name: String,
    /// Size cap in bytes that the watermarks are fractions of
    pub max_cache_bytes: u64,
    /// Maximum number of downloads running at once; extra requests queue
    pub max_concurrent_downloads: usize,
    /// Eviction starts when the footprint exceeds this fraction of the cap
    pub high_watermark: f64,
    /// Eviction stops once the footprint is at or below this fraction of the cap
    pub low_watermark: f64,
    /// Period of the background eviction pass
    pub eviction_interval: Duration,
    /// A download taking longer than this fails
    pub download_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            app_name: "reelcache".to_string(),
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
            eviction_interval: DEFAULT_EVICTION_INTERVAL,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }
}

impl CacheConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; missing or unparsable values fall back to
    /// the defaults. The result is validated before it is returned.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let cache_dir = env::var("REELCACHE_DIR")
            .ok()
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);

        let app_name = env::var("REELCACHE_APP_NAME").unwrap_or(defaults.app_name);

        let config = CacheConfig {
            cache_dir,
            app_name,
            max_cache_bytes: parse_or("REELCACHE_MAX_BYTES", defaults.max_cache_bytes),
            max_concurrent_downloads: parse_or(
                "REELCACHE_MAX_CONCURRENT",
                defaults.max_concurrent_downloads,
            ),
            high_watermark: parse_or("REELCACHE_HIGH_WATERMARK", defaults.high_watermark),
            low_watermark: parse_or("REELCACHE_LOW_WATERMARK", defaults.low_watermark),
            eviction_interval: Duration::from_secs(parse_or(
                "REELCACHE_EVICTION_INTERVAL_SECS",
                defaults.eviction_interval.as_secs(),
            )),
            download_timeout: Duration::from_secs(parse_or(
                "REELCACHE_DOWNLOAD_TIMEOUT_SECS",
                defaults.download_timeout.as_secs(),
            )),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the cache cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_bytes == 0 {
            return Err(CacheError::Config(
                "max_cache_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(CacheError::Config(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("high_watermark", self.high_watermark),
            ("low_watermark", self.low_watermark),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(CacheError::Config(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if self.low_watermark >= self.high_watermark {
            return Err(CacheError::Config(format!(
                "low_watermark ({}) must be below high_watermark ({})",
                self.low_watermark, self.high_watermark
            )));
        }
        if self.eviction_interval.is_zero() {
            return Err(CacheError::Config(
                "eviction_interval must be non-zero".to_string(),
            ));
        }
        if self.download_timeout.is_zero() {
            return Err(CacheError::Config(
                "download_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T: FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
