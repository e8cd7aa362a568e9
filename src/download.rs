//! Streaming downloads into the cache root.
//!
//! Bytes are written to `<key>.<attempt>.part` as they arrive, the result
//! is checked by a [`MediaValidator`], and only then renamed to `<key>`. Any
//! failure removes the partial file.

use crate::error::{CacheError, Result};
use crate::metrics;
use crate::stats::DownloadProgress;
use crate::store::PARTIAL_SUFFIX;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Bytes read from the start of a file when probing its container.
const PROBE_LEN: usize = 512;

/// MPEG transport stream packet size.
const TS_PACKET_LEN: usize = 188;

/// Decides whether a downloaded file is usable media.
#[async_trait]
pub trait MediaValidator: Send + Sync {
    /// Returns `Err(reason)` when the file should be rejected.
    async fn validate(&self, path: &Path) -> std::result::Result<(), String>;
}

/// Recognizes common video containers by their leading bytes.
#[derive(Clone, Debug, Default)]
pub struct ContainerProbe;

#[async_trait]
impl MediaValidator for ContainerProbe {
    async fn validate(&self, path: &Path) -> std::result::Result<(), String> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| format!("cannot open: {e}"))?;
        let mut header = Vec::with_capacity(PROBE_LEN);
        file.take(PROBE_LEN as u64)
            .read_to_end(&mut header)
            .await
            .map_err(|e| format!("cannot read: {e}"))?;

        match sniff_container(&header) {
            Some(_) => Ok(()),
            None if header.is_empty() => Err("file is empty".to_string()),
            None => Err("unrecognized container format".to_string()),
        }
    }
}

/// Name of the container `header` starts with, if recognized.
pub fn sniff_container(header: &[u8]) -> Option<&'static str> {
    const BMFF_BOXES: [&[u8; 4]; 6] = [b"ftyp", b"moov", b"mdat", b"free", b"skip", b"wide"];

    if header.len() >= 8 && BMFF_BOXES.iter().any(|b| &header[4..8] == b.as_slice()) {
        return Some("iso-bmff");
    }
    if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some("matroska");
    }
    if header.len() >= 12 && header.starts_with(b"RIFF") && &header[8..12] == b"AVI " {
        return Some("avi");
    }
    if header.starts_with(b"OggS") {
        return Some("ogg");
    }
    if header.starts_with(b"FLV") {
        return Some("flv");
    }
    if header.first() == Some(&0x47)
        && (header.len() <= TS_PACKET_LEN || header[TS_PACKET_LEN] == 0x47)
    {
        return Some("mpeg-ts");
    }
    None
}

/// A file that was fetched, validated and published under its key.
#[derive(Clone, Debug)]
pub struct Downloaded {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Fetches one URL at a time into the cache root.
#[derive(Clone)]
pub struct Downloader {
    client: Client,
    timeout: Duration,
    validator: Arc<dyn MediaValidator>,
}

impl Downloader {
    pub fn new(client: Client, timeout: Duration, validator: Arc<dyn MediaValidator>) -> Self {
        Self {
            client,
            timeout,
            validator,
        }
    }

    /// Path of one download attempt for `key`. Attempts never share a file.
    pub fn partial_path(root: &Path, key: &str, attempt: u64) -> PathBuf {
        root.join(format!("{key}.{attempt}{PARTIAL_SUFFIX}"))
    }

    /// Download `url` into `root/<key>`.
    ///
    /// On error nothing is left behind under either name.
    pub async fn fetch(
        &self,
        url: &str,
        root: &Path,
        key: &str,
        attempt: u64,
        progress: &DownloadProgress,
    ) -> Result<Downloaded> {
        let partial = Self::partial_path(root, key, attempt);

        let outcome = match tokio::time::timeout(
            self.timeout,
            self.stream_to_file(url, &partial, progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                url: url.to_string(),
                timeout: self.timeout,
            }),
        };

        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(e) => {
                discard(&partial).await;
                return Err(e);
            }
        };

        if let Err(reason) = self.validator.validate(&partial).await {
            warn!("Rejecting download of {}: {}", url, reason);
            discard(&partial).await;
            return Err(CacheError::InvalidMedia {
                url: url.to_string(),
                reason,
            });
        }

        let path = root.join(key);
        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            discard(&partial).await;
            return Err(CacheError::io("publishing downloaded file")(e));
        }

        debug!("Downloaded {} bytes from {} to {}", bytes, url, path.display());
        Ok(Downloaded { path, bytes })
    }

    async fn stream_to_file(
        &self,
        url: &str,
        partial: &Path,
        progress: &DownloadProgress,
    ) -> Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(CacheError::network(url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let expected = response.content_length();
        if let Some(total) = expected {
            progress.set_total(total);
        }

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(CacheError::io("creating partial download"))?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                // Connection closed before Content-Length bytes arrived
                Err(e)
                    if (e.is_body() || e.is_decode())
                        && expected.is_some_and(|total| written < total) =>
                {
                    return Err(truncated(url, written, expected.unwrap_or_default()));
                }
                Err(e) => return Err(CacheError::network(url)(e)),
            };
            file.write_all(&chunk)
                .await
                .map_err(CacheError::io("writing partial download"))?;
            written += chunk.len() as u64;
            progress.add(chunk.len() as u64);
        }

        file.flush()
            .await
            .map_err(CacheError::io("flushing partial download"))?;
        file.sync_all()
            .await
            .map_err(CacheError::io("syncing partial download"))?;
        metrics::record_bytes(written);

        if let Some(total) = expected
            && written < total
        {
            return Err(truncated(url, written, total));
        }

        Ok(written)
    }
}

fn truncated(url: &str, written: u64, total: u64) -> CacheError {
    CacheError::InvalidMedia {
        url: url.to_string(),
        reason: format!("truncated: got {written} of {total} bytes"),
    }
}

/// Best-effort removal of a partial file.
pub(crate) async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial download {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mp4_body(len: usize) -> Vec<u8> {
        let mut body = vec![0u8; len.max(16)];
        body[..12].copy_from_slice(&[0, 0, 0, 0x18, b'f', b't', b'y', b'p', b'i', b's', b'o', b'm']);
        body
    }

    fn downloader(timeout: Duration) -> Downloader {
        Downloader::new(Client::new(), timeout, Arc::new(ContainerProbe))
    }

    fn dir_names(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn sniffs_known_containers() {
        assert_eq!(sniff_container(&mp4_body(64)), Some("iso-bmff"));
        assert_eq!(
            sniff_container(&[0x1A, 0x45, 0xDF, 0xA3, 0x01]),
            Some("matroska")
        );
        assert_eq!(sniff_container(b"RIFF\x00\x00\x00\x00AVI LIST"), Some("avi"));
        assert_eq!(sniff_container(b"OggS\x00\x02"), Some("ogg"));
        assert_eq!(sniff_container(b"FLV\x01\x05"), Some("flv"));

        let mut ts = vec![0u8; 400];
        ts[0] = 0x47;
        ts[188] = 0x47;
        assert_eq!(sniff_container(&ts), Some("mpeg-ts"));
    }

    #[test]
    fn rejects_unknown_or_empty() {
        assert_eq!(sniff_container(b""), None);
        assert_eq!(sniff_container(b"<!DOCTYPE html><html>"), None);
        assert_eq!(sniff_container(b"{\"error\":\"denied\"}"), None);

        // Sync byte without a second packet boundary
        let mut ts = vec![0u8; 400];
        ts[0] = 0x47;
        assert_eq!(sniff_container(&ts), None);
    }

    #[tokio::test]
    async fn downloads_and_publishes_under_key() {
        let server = MockServer::start().await;
        let body = mp4_body(4096);
        Mock::given(method("GET"))
            .and(path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let progress = DownloadProgress::default();
        let url = format!("{}/clip.mp4", server.uri());

        let done = downloader(Duration::from_secs(5))
            .fetch(&url, tmp.path(), "abc.mp4", 0, &progress)
            .await
            .unwrap();

        assert_eq!(done.path, tmp.path().join("abc.mp4"));
        assert_eq!(done.bytes, 4096);
        assert_eq!(std::fs::read(&done.path).unwrap(), body);
        assert_eq!(progress.downloaded(), 4096);
        assert_eq!(progress.total(), 4096);
        assert_eq!(dir_names(tmp.path()), vec!["abc.mp4"]);
    }

    #[tokio::test]
    async fn server_error_leaves_nothing_behind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let result = downloader(Duration::from_secs(5))
            .fetch(&server.uri(), tmp.path(), "abc.mp4", 0, &DownloadProgress::default())
            .await;

        assert!(matches!(
            result,
            Err(CacheError::HttpStatus { status: 500, .. })
        ));
        assert!(dir_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn invalid_media_is_deleted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let result = downloader(Duration::from_secs(5))
            .fetch(&server.uri(), tmp.path(), "abc.mp4", 0, &DownloadProgress::default())
            .await;

        assert!(matches!(result, Err(CacheError::InvalidMedia { .. })));
        assert!(dir_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn empty_body_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let result = downloader(Duration::from_secs(5))
            .fetch(&server.uri(), tmp.path(), "abc.mp4", 0, &DownloadProgress::default())
            .await;

        match result {
            Err(CacheError::InvalidMedia { reason, .. }) => assert_eq!(reason, "file is empty"),
            other => panic!("expected InvalidMedia, got {other:?}"),
        }
        assert!(dir_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn slow_origin_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(mp4_body(64))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let result = downloader(Duration::from_millis(100))
            .fetch(&server.uri(), tmp.path(), "abc.mp4", 0, &DownloadProgress::default())
            .await;

        assert!(matches!(result, Err(CacheError::Timeout { .. })));
        assert!(dir_names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn custom_validator_is_used() {
        struct RejectAll;

        #[async_trait]
        impl MediaValidator for RejectAll {
            async fn validate(&self, _path: &Path) -> std::result::Result<(), String> {
                Err("policy".to_string())
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(mp4_body(64)))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let result = Downloader::new(Client::new(), Duration::from_secs(5), Arc::new(RejectAll))
            .fetch(&server.uri(), tmp.path(), "abc.mp4", 0, &DownloadProgress::default())
            .await;

        assert!(matches!(result, Err(CacheError::InvalidMedia { reason, .. }) if reason == "policy"));
    }

    #[test]
    fn attempts_use_distinct_partial_files() {
        let root = Path::new("/cache");
        let first = Downloader::partial_path(root, "abc.mp4", 1);
        let second = Downloader::partial_path(root, "abc.mp4", 2);

        assert_ne!(first, second);
        assert_eq!(first, root.join("abc.mp4.1.part"));
        assert!(second.to_string_lossy().ends_with(PARTIAL_SUFFIX));
    }

    #[tokio::test]
    async fn short_body_is_reported_as_truncated() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        // Origin promises 1000 bytes, sends 100 and hangs up
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let mut response =
                b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\n".to_vec();
            response.extend_from_slice(&mp4_body(100));
            socket.write_all(&response).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let tmp = tempfile::tempdir().unwrap();
        let result = downloader(Duration::from_secs(5))
            .fetch(
                &format!("http://{addr}/clip.mp4"),
                tmp.path(),
                "abc.mp4",
                7,
                &DownloadProgress::default(),
            )
            .await;

        match result {
            Err(CacheError::InvalidMedia { reason, .. }) => {
                assert!(reason.starts_with("truncated"), "reason: {reason}")
            }
            other => panic!("expected truncated InvalidMedia, got {other:?}"),
        }
        assert!(dir_names(tmp.path()).is_empty());
    }
}
