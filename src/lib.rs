//! Disk-backed cache for large immutable media files fetched over HTTP.
//!
//! ```no_run
//! use reelcache::{CacheConfig, MediaCache, Priority};
//!
//! # async fn demo() -> reelcache::Result<()> {
//! let cache = MediaCache::open(CacheConfig::from_env()?).await?;
//! cache
//!     .preload(["https://cdn.example.com/next.mp4"], Priority::High)
//!     .await;
//! let path = cache
//!     .resolve("https://cdn.example.com/now.mp4", Priority::Normal)
//!     .await?;
//! # let _ = path;
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod dir;
pub mod download;
pub mod error;
pub mod eviction;
pub mod key;
pub mod metrics;
pub mod stats;
pub mod store;

pub use cache::MediaCache;
pub use config::CacheConfig;
pub use coordinator::{PendingFetch, Priority, Resolution};
pub use error::{CacheError, Result};
pub use eviction::EvictionReport;
pub use stats::BandwidthStats;
