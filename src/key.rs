//! Content-addressed cache keys.
//!
//! A key is the first 32 hex characters of the SHA-256 of the URL followed by
//! the URL's file extension, e.g. `9f86d081884c7d659a2feaa0c55ad015.mp4`. The
//! key doubles as the file name of the cached media.

use sha2::{Digest, Sha256};
use url::Url;

/// Number of hex characters kept from the digest (128 bits).
pub const KEY_HASH_LEN: usize = 32;

/// Extension used when the URL does not carry a usable one.
pub const FALLBACK_EXTENSION: &str = "mp4";

const MAX_EXTENSION_LEN: usize = 5;

/// Derive the cache key for `url`.
///
/// The hash covers the full URL string (query included, since pre-signed URLs
/// differ only there), while the extension ignores query and fragment.
pub fn derive_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(KEY_HASH_LEN);
    format!("{}.{}", hash, extension_of(url))
}

/// Best-effort file extension of the resource named by `url`.
pub fn extension_of(url: &str) -> String {
    let last_segment = match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(str::to_string),
        // Not a full URL: strip query/fragment by hand
        Err(_) => url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .map(str::to_string),
    };

    last_segment
        .as_deref()
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        })
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}
