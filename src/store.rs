//! Persisted key → file mapping.
//!
//! The mapping lives in `mapping.json` in the cache root and is rewritten in
//! full after every insert or removal. Writes go to `mapping.json.tmp` first
//! and are published with a rename, so the live file is always a complete
//! snapshot: either the previous one or the new one.

use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const MAPPING_FILE: &str = "mapping.json";
pub const MAPPING_TMP_FILE: &str = "mapping.json.tmp";

/// Suffix of in-progress downloads in the cache root.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Current on-disk schema version.
pub const MAPPING_VERSION: u32 = 1;

/// A completed, verified cached file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub local_path: PathBuf,
    pub last_accessed_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    /// File name relative to the cache root
    path: String,
    last_accessed: DateTime<Utc>,
}

/// On-disk document as read; entries are decoded one by one so a single bad
/// record does not discard the rest.
#[derive(Deserialize)]
struct MappingDocument {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct MappingSnapshot<'a> {
    version: u32,
    entries: BTreeMap<&'a str, PersistedEntry>,
}

/// In-memory mapping plus its persistence.
#[derive(Debug)]
pub struct MetadataStore {
    root: PathBuf,
    entries: HashMap<String, CacheEntry>,
    /// Last-access updates not yet written to disk
    dirty: bool,
}

impl MetadataStore {
    /// Load the mapping from `root`.
    ///
    /// Never fails: an absent, unreadable, corrupt or foreign-version mapping
    /// yields an empty store, and entries whose file is gone are dropped.
    pub async fn load(root: &Path) -> Self {
        let mut store = Self {
            root: root.to_path_buf(),
            entries: HashMap::new(),
            dirty: false,
        };

        let mapping_path = root.join(MAPPING_FILE);
        let bytes = match tokio::fs::read(&mapping_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No cache mapping at {}, starting empty", mapping_path.display());
                return store;
            }
            Err(e) => {
                warn!("Failed to read cache mapping {}: {}", mapping_path.display(), e);
                return store;
            }
        };

        let document: MappingDocument = match serde_json::from_slice(&bytes) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Cache mapping is corrupt, starting empty: {}", e);
                return store;
            }
        };

        if document.version != MAPPING_VERSION {
            warn!(
                "Cache mapping version {} not supported (expected {}), starting empty",
                document.version, MAPPING_VERSION
            );
            return store;
        }

        let mut dropped = 0usize;
        for (key, value) in document.entries {
            let Ok(record) = serde_json::from_value::<PersistedEntry>(value) else {
                dropped += 1;
                continue;
            };
            if !is_bare_file_name(&record.path) {
                dropped += 1;
                continue;
            }
            let local_path = root.join(&record.path);
            match tokio::fs::metadata(&local_path).await {
                Ok(meta) if meta.is_file() => {
                    store.entries.insert(
                        key.clone(),
                        CacheEntry {
                            key,
                            local_path,
                            last_accessed_at: record.last_accessed,
                        },
                    );
                }
                _ => dropped += 1,
            }
        }

        if dropped > 0 {
            info!("Dropped {} stale or malformed cache entries on load", dropped);
            // The on-disk mapping no longer matches memory
            store.dirty = true;
        }
        debug!("Loaded {} cache entries", store.entries.len());
        store
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Mark `key` as accessed now. The change is persisted lazily.
    pub fn touch(&mut self, key: &str) -> Option<&CacheEntry> {
        let entry = self.entries.get_mut(key)?;
        entry.last_accessed_at = Utc::now();
        self.dirty = true;
        Some(entry)
    }

    /// Insert or replace `entry`, then persist.
    pub async fn upsert(&mut self, entry: CacheEntry) -> Result<()> {
        self.entries.insert(entry.key.clone(), entry);
        self.persist().await
    }

    /// Remove `key`, then persist. Removing an absent key does not write.
    pub async fn remove(&mut self, key: &str) -> Result<Option<CacheEntry>> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Drop every in-memory entry without touching disk.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = false;
    }

    /// Persist only if there are unwritten changes.
    pub async fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.persist().await?;
        }
        Ok(())
    }

    /// Atomically rewrite the mapping file.
    pub async fn persist(&mut self) -> Result<()> {
        let bytes = self.encode()?;
        let tmp_path = self.root.join(MAPPING_TMP_FILE);
        self.write_tmp(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, self.root.join(MAPPING_FILE))
            .await
            .map_err(CacheError::io("publishing cache mapping"))?;
        self.dirty = false;
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut entries = BTreeMap::new();
        for entry in self.entries.values() {
            let Some(name) = entry.local_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            entries.insert(
                entry.key.as_str(),
                PersistedEntry {
                    path: name.to_string(),
                    last_accessed: entry.last_accessed_at,
                },
            );
        }
        let snapshot = MappingSnapshot {
            version: MAPPING_VERSION,
            entries,
        };
        Ok(serde_json::to_vec_pretty(&snapshot)?)
    }

    async fn write_tmp(&self, tmp_path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = tokio::fs::File::create(tmp_path)
            .await
            .map_err(CacheError::io("creating temporary mapping"))?;
        file.write_all(bytes)
            .await
            .map_err(CacheError::io("writing temporary mapping"))?;
        file.sync_all()
            .await
            .map_err(CacheError::io("syncing temporary mapping"))?;
        Ok(())
    }

    /// Remove files in the root that the mapping does not account for:
    /// partial downloads, a temp mapping left by a crash, and media published
    /// but never committed. Returns how many files were removed.
    pub async fn sweep(&self) -> usize {
        let referenced: HashSet<&Path> =
            self.entries.values().map(|e| e.local_path.as_path()).collect();

        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Cannot scan cache dir {}: {}", self.root.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let item = match dir.next_entry().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error scanning cache dir: {}", e);
                    break;
                }
            };
            let path = item.path();
            let is_file = item.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file || path.file_name() == Some(OsStr::new(MAPPING_FILE)) {
                continue;
            }
            if referenced.contains(path.as_path()) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Swept orphan cache file {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove orphan {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            info!("Swept {} orphaned files from cache dir", removed);
        }
        removed
    }
}

fn is_bare_file_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty() && path.file_name().and_then(|n| n.to_str()) == Some(name)
}
