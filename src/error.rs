//! Error taxonomy for the media cache.
//!
//! Every fetch outcome is broadcast to all coalesced waiters, so the error
//! type is `Clone`. Sources that are not `Clone` themselves are kept behind
//! an `Arc`.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("origin returned HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: Arc<reqwest::Error>,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] Arc<reqwest::Error>),

    #[error("download of {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("downloaded file for {url} is not playable media: {reason}")]
    InvalidMedia { url: String, reason: String },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("failed to encode cache mapping: {0}")]
    Serialize(#[source] Arc<serde_json::Error>),

    #[error("invalid cache configuration: {0}")]
    Config(String),

    #[error("fetch of {0} was cancelled")]
    Cancelled(String),

    #[error("media cache has been shut down")]
    ShutDown,
}

impl CacheError {
    /// Adapter for `map_err` that tags an I/O error with what was being done.
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> CacheError {
        move |source| CacheError::Io {
            context,
            source: Arc::new(source),
        }
    }

    pub(crate) fn network(url: &str) -> impl FnOnce(reqwest::Error) -> CacheError + '_ {
        move |source| CacheError::Network {
            url: url.to_string(),
            source: Arc::new(source),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialize(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_clone_and_keep_source() {
        let err = CacheError::io("writing mapping")(io::Error::other("disk on fire"));
        let cloned = err.clone();
        assert_eq!(
            cloned.to_string(),
            "I/O error while writing mapping: disk on fire"
        );
        assert!(std::error::Error::source(&cloned).is_some());
    }

    #[test]
    fn http_status_message() {
        let err = CacheError::HttpStatus {
            status: 500,
            url: "https://cdn.example.com/a.mp4".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "origin returned HTTP 500 for https://cdn.example.com/a.mp4"
        );
    }
}
