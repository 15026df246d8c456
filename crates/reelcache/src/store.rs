//! Content-addressed on-disk store for fetched playlists, segments and keys.
//!
//! One file per cache key under the configured root directory, plus a
//! small JSON sidecar with the origin URL, mime type and timestamp.
//! All filesystem writes are funnelled through a single writer task so
//! concurrent writers to the same key serialize and the last one wins.

use crate::config::StoreConfig;
use crate::error::CacheProxyError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};
use url::Url;

/// Stable content address for an origin URL: the SHA-256 digest of its
/// absolute string, hex encoded. Identical URLs (query string included)
/// always map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_url(url: &Url) -> Self {
        let digest = Sha256::digest(url.as_str().as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    origin_url: String,
    mime_type: Option<String>,
    stored_at: DateTime<Utc>,
}

/// A cache entry read back from disk.
#[derive(Debug)]
pub struct StoredEntry {
    pub bytes: Bytes,
    pub mime_type: Option<String>,
    pub stored_at: Option<DateTime<Utc>>,
}

enum WriteOp {
    Put {
        key: CacheKey,
        bytes: Bytes,
        meta: EntryMeta,
    },
    Clear,
    Barrier(oneshot::Sender<()>),
}

/// Persistent segment store. Cheap to clone; all clones share the same
/// writer task.
#[derive(Clone)]
pub struct SegmentStore {
    root: PathBuf,
    writer_tx: mpsc::UnboundedSender<WriteOp>,
}

impl SegmentStore {
    /// Create the store, creating the root directory if absent and
    /// spawning the writer task. Must be called within a Tokio runtime.
    pub fn new(config: &StoreConfig) -> Result<Self, CacheProxyError> {
        let root = config.root.clone();
        std::fs::create_dir_all(&root)?;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(root.clone(), writer_rx));

        Ok(Self { root, writer_tx })
    }

    fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.meta", key.as_str()))
    }

    /// Whether an entry for `origin` is present on disk.
    pub async fn has(&self, origin: &Url) -> bool {
        let path = self.data_path(&CacheKey::for_url(origin));
        tokio::fs::try_exists(&path).await.unwrap_or(false)
    }

    /// Read an entry back, or `None` if absent or unreadable. The meta
    /// sidecar is best-effort; a missing or corrupt sidecar still yields
    /// the bytes.
    pub async fn read(&self, origin: &Url) -> Option<StoredEntry> {
        let key = CacheKey::for_url(origin);
        let bytes = match tokio::fs::read(self.data_path(&key)).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => return None,
        };

        let meta: Option<EntryMeta> = match tokio::fs::read(self.meta_path(&key)).await {
            Ok(raw) => serde_json::from_slice(&raw).ok(),
            Err(_) => None,
        };

        Some(StoredEntry {
            bytes,
            mime_type: meta.as_ref().and_then(|m| m.mime_type.clone()),
            stored_at: meta.map(|m| m.stored_at),
        })
    }

    /// Queue a write for `origin`. Fire-and-forget: failures are logged
    /// by the writer task and never surfaced, so a full disk degrades to
    /// cache misses instead of breaking playback. Overwrites any existing
    /// entry for the same key wholesale.
    pub fn write(&self, bytes: Bytes, origin: &Url, mime_type: Option<&str>) {
        let op = WriteOp::Put {
            key: CacheKey::for_url(origin),
            bytes,
            meta: EntryMeta {
                origin_url: origin.to_string(),
                mime_type: mime_type.map(str::to_owned),
                stored_at: Utc::now(),
            },
        };
        if self.writer_tx.send(op).is_err() {
            error!("segment store writer task is gone; dropping write");
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let _ = self.writer_tx.send(WriteOp::Clear);
    }

    /// Wait until all previously queued writes have been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer_tx.send(WriteOp::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Keys currently present on disk (diagnostics).
    pub async fn cached_summary(&self) -> Vec<String> {
        let mut keys = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.root).await else {
            return keys;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".meta") && !name.ends_with(".tmp") {
                    keys.push(name.to_owned());
                }
            }
        }
        keys
    }
}

async fn writer_loop(root: PathBuf, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Put { key, bytes, meta } => {
                if let Err(e) = write_entry(&root, &key, &bytes, &meta).await {
                    error!(key = %key, error = %e, "cache write failed");
                } else {
                    debug!(key = %key, size = bytes.len(), "cache entry written");
                }
            }
            WriteOp::Clear => {
                if let Err(e) = tokio::fs::remove_dir_all(&root).await {
                    error!(error = %e, "cache clear failed");
                }
                if let Err(e) = tokio::fs::create_dir_all(&root).await {
                    error!(error = %e, "cache root re-creation failed");
                }
            }
            WriteOp::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn write_entry(
    root: &Path,
    key: &CacheKey,
    bytes: &Bytes,
    meta: &EntryMeta,
) -> std::io::Result<()> {
    let final_path = root.join(key.as_str());
    let tmp_path = root.join(format!("{}.tmp", key.as_str()));

    // Write-then-rename so readers never observe a partial entry.
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;

    let meta_json = serde_json::to_vec(meta).map_err(std::io::Error::other)?;
    tokio::fs::write(root.join(format!("{}.meta", key.as_str())), meta_json).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn store_in(dir: &tempfile::TempDir) -> SegmentStore {
        SegmentStore::new(&StoreConfig {
            root: dir.path().to_path_buf(),
        })
        .expect("store")
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn key_is_deterministic_and_distinct() {
        let a = url("https://example.com/seg0.ts?token=x");
        let b = url("https://example.com/seg0.ts?token=y");
        assert_eq!(CacheKey::for_url(&a), CacheKey::for_url(&a));
        assert_ne!(CacheKey::for_url(&a), CacheKey::for_url(&b));
        assert_eq!(CacheKey::for_url(&a).as_str().len(), 64);
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let origin = url("https://example.com/videos/1/hls/seg0.ts");

        assert!(!store.has(&origin).await);
        store.write(Bytes::from_static(b"segment-bytes"), &origin, Some("video/MP2T"));
        store.flush().await;

        assert!(store.has(&origin).await);
        let entry = store.read(&origin).await.expect("entry");
        assert_eq!(entry.bytes.as_ref(), b"segment-bytes");
        assert_eq!(entry.mime_type.as_deref(), Some("video/MP2T"));
        assert!(entry.stored_at.is_some());
    }

    #[tokio::test]
    async fn rewrite_overwrites_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let origin = url("https://example.com/playlist.m3u8");

        store.write(Bytes::from_static(b"first"), &origin, None);
        store.write(Bytes::from_static(b"second"), &origin, None);
        store.flush().await;

        let entry = store.read(&origin).await.expect("entry");
        assert_eq!(entry.bytes.as_ref(), b"second");
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let origin = url("https://example.com/seg0.ts");

        store.write(Bytes::from_static(b"data"), &origin, None);
        store.clear();
        store.flush().await;

        assert!(!store.has(&origin).await);
        assert!(store.cached_summary().await.is_empty());
    }

    #[tokio::test]
    async fn summary_lists_data_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.write(Bytes::from_static(b"a"), &url("https://example.com/a.ts"), None);
        store.write(Bytes::from_static(b"b"), &url("https://example.com/b.ts"), None);
        store.flush().await;

        let summary = store.cached_summary().await;
        assert_eq!(summary.len(), 2);
        assert!(summary.iter().all(|k| k.len() == 64));
    }
}
